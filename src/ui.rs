use std::collections::HashSet;
use std::fs;
use std::io::{self, Stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use textwrap::{wrap, Options as WrapOptions};
use tracing::{info, warn};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::cast::{ResolvedCast, ENCLOSURE_PREFIX};
use crate::checkpoint::CheckpointStore;
use crate::download::{DownloadCoordinator, DownloadProgress};
use crate::enclosure::{EnclosureMetadata, EnclosureResolver};
use crate::feed::FeedWalker;
use crate::handles::HandleDirectory;
use crate::hub::Hub;
use crate::live::{FeedEvent, LiveFeedSubscriber, StreamState, Subscription, INITIAL_FOLLOWS_LIMIT};
use crate::publish::{Published, Publisher, UploadRequest, UploadStage, DEFAULT_CAST_TEXT};
use crate::viewport::{ListView, Measured};

const COLOR_BG: Color = Color::Rgb(30, 30, 46);
const COLOR_PANEL_BG: Color = Color::Rgb(24, 24, 36);
const COLOR_PANEL_FOCUSED_BG: Color = Color::Rgb(49, 50, 68);
const COLOR_PANEL_SELECTED_BG: Color = Color::Rgb(69, 71, 90);
const COLOR_TEXT_PRIMARY: Color = Color::Rgb(205, 214, 244);
const COLOR_TEXT_SECONDARY: Color = Color::Rgb(166, 173, 200);
const COLOR_ACCENT: Color = Color::Rgb(137, 180, 250);
const COLOR_LEMON: Color = Color::Rgb(249, 226, 175);
const COLOR_SUCCESS: Color = Color::Rgb(166, 227, 161);
const COLOR_ERROR: Color = Color::Rgb(243, 139, 168);

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const WRAP_WIDTH: usize = 79;
/// Casts fetched per author when the TUI starts.
const BACKFILL_LIMIT: usize = 1000;
const TICK_RATE: Duration = Duration::from_millis(120);

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let percent_x = percent_x.min(100);
    let percent_y = percent_y.min(100);
    let horizontal = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage(100 - percent_x - (100 - percent_x) / 2),
        ])
        .split(area);
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage(100 - percent_y - (100 - percent_y) / 2),
        ])
        .split(horizontal[1]);
    vertical[1]
}

struct Spinner {
    index: usize,
    last_tick: Instant,
}

impl Spinner {
    fn new() -> Self {
        Self {
            index: 0,
            last_tick: Instant::now(),
        }
    }

    fn frame(&self) -> &'static str {
        SPINNER_FRAMES[self.index % SPINNER_FRAMES.len()]
    }

    fn advance(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_tick) >= TICK_RATE {
            self.index = (self.index + 1) % SPINNER_FRAMES.len();
            self.last_tick = now;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.index = 0;
        self.last_tick = Instant::now();
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ItemStatus {
    Idle,
    Resolving,
    Downloading(DownloadProgress),
    Saved(PathBuf),
    Failed(String),
}

impl ItemStatus {
    fn is_busy(&self) -> bool {
        matches!(self, ItemStatus::Resolving | ItemStatus::Downloading(_))
    }

    fn line(&self) -> Option<String> {
        match self {
            ItemStatus::Idle => None,
            ItemStatus::Resolving => Some("resolving metadata…".to_string()),
            ItemStatus::Downloading(progress) => {
                Some(format!("downloading {:.0}%", progress.percent()))
            }
            ItemStatus::Saved(path) => Some(format!("saved to {}", path.display())),
            ItemStatus::Failed(reason) => Some(format!("error: {reason}")),
        }
    }
}

/// One cast in the list together with its pre-rendered lines.
struct CastItem {
    cast: ResolvedCast,
    status: ItemStatus,
    lines: Vec<String>,
}

impl CastItem {
    fn new(cast: ResolvedCast) -> Self {
        Self {
            cast,
            status: ItemStatus::Idle,
            lines: Vec::new(),
        }
    }

    fn render(&mut self, handles: &HandleDirectory, follows: &HashSet<u64>) {
        self.lines = cast_lines(
            &self.cast,
            &self.status,
            follows.contains(&self.cast.author_id),
            |fid| handles.cached_or_unknown(fid),
        );
    }
}

impl Measured for CastItem {
    fn block_height(&self) -> usize {
        self.lines.len()
    }
}

/// Renders a cast as a boxed block: header, wrapped text, then the enclosure.
fn cast_lines<F>(cast: &ResolvedCast, status: &ItemStatus, followed: bool, handle_for: F) -> Vec<String>
where
    F: FnMut(u64) -> String,
{
    let mut body = Vec::new();
    let marker = if followed { " ★" } else { "" };
    body.push(format!(
        "{}{} [{}]",
        cast.reference(),
        marker,
        cast.posted_at().format("%Y-%m-%d %H:%M")
    ));

    let text = cast.text_with_mentions(handle_for);
    if !text.trim().is_empty() {
        body.extend(
            wrap(text.trim(), WrapOptions::new(WRAP_WIDTH))
                .into_iter()
                .map(|line| line.into_owned()),
        );
    }

    body.push("----".to_string());
    if let Some(meta) = &cast.enclosure {
        body.push(enclosure_summary(meta));
        if !meta.description.trim().is_empty() {
            body.extend(
                wrap(meta.description.trim(), WrapOptions::new(WRAP_WIDTH))
                    .into_iter()
                    .map(|line| line.into_owned()),
            );
        }
    }
    body.push(format!("{ENCLOSURE_PREFIX}{}", cast.enclosure_cid));
    if let Some(line) = status.line() {
        body.push(line);
    }

    let mut lines: Vec<String> = body
        .into_iter()
        .enumerate()
        .map(|(n, line)| {
            if n == 0 {
                format!("┌─ {line}")
            } else {
                format!("│ {line}")
            }
        })
        .collect();
    lines.push("└───".to_string());
    lines
}

fn enclosure_summary(meta: &EnclosureMetadata) -> String {
    let title = if meta.title.trim().is_empty() {
        meta.filename.as_str()
    } else {
        meta.title.as_str()
    };
    let mut summary = format!("{title} ({}", meta.human_size());
    if !meta.mime_type.is_empty() {
        summary.push_str(", ");
        summary.push_str(&meta.mime_type);
    }
    summary.push(')');
    summary
}

fn styled_block(lines: &[String], selected: bool) -> Vec<Line<'static>> {
    let base = if selected {
        Style::default().bg(COLOR_PANEL_SELECTED_BG)
    } else {
        Style::default()
    };
    let mut in_enclosure = false;
    lines
        .iter()
        .enumerate()
        .map(|(n, line)| {
            if line == "│ ----" {
                in_enclosure = true;
            }
            let style = if n == 0 {
                base.fg(COLOR_ACCENT).add_modifier(Modifier::BOLD)
            } else if line.starts_with("│ error:") {
                base.fg(COLOR_ERROR)
            } else if line.starts_with("│ saved to") {
                base.fg(COLOR_SUCCESS)
            } else if in_enclosure {
                base.fg(COLOR_LEMON)
            } else {
                base.fg(COLOR_TEXT_PRIMARY)
            };
            Line::from(Span::styled(line.clone(), style))
        })
        .collect()
}

/// Shortens `text` to at most `width` columns, ending in an ellipsis when cut.
fn fit_width(text: &str, width: usize) -> String {
    if UnicodeWidthStr::width(text) <= width {
        return text.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let w = UnicodeWidthChar::width(ch).unwrap_or(0);
        if used + w + 1 > width {
            break;
        }
        used += w;
        out.push(ch);
    }
    out.push('…');
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PickerEntry {
    name: String,
    path: PathBuf,
    is_dir: bool,
}

/// Directory browser used to choose the file to upload. Hidden entries are
/// left out; directories sort before files.
#[derive(Debug, Default)]
struct FilePicker {
    dir: PathBuf,
    entries: Vec<PickerEntry>,
    selected: usize,
    error: Option<String>,
}

impl FilePicker {
    fn open(dir: &Path) -> Self {
        let mut picker = Self {
            dir: dir.to_path_buf(),
            ..Self::default()
        };
        picker.load();
        picker
    }

    fn load(&mut self) {
        self.entries.clear();
        self.selected = 0;
        self.error = None;
        if let Some(parent) = self.dir.parent() {
            self.entries.push(PickerEntry {
                name: "..".to_string(),
                path: parent.to_path_buf(),
                is_dir: true,
            });
        }
        let read = match fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(err) => {
                self.error = Some(format!("{}: {err}", self.dir.display()));
                return;
            }
        };
        let mut listed: Vec<PickerEntry> = read
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    return None;
                }
                let is_dir = entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false);
                Some(PickerEntry {
                    name,
                    path: entry.path(),
                    is_dir,
                })
            })
            .collect();
        listed.sort_by(|a, b| {
            b.is_dir
                .cmp(&a.is_dir)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        self.entries.extend(listed);
    }

    fn move_up(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    fn move_down(&mut self) {
        if self.selected + 1 < self.entries.len() {
            self.selected += 1;
        }
    }

    fn selected(&self) -> Option<&PickerEntry> {
        self.entries.get(self.selected)
    }

    fn enter_dir(&mut self, dir: PathBuf) {
        self.dir = dir;
        self.load();
    }

    fn go_parent(&mut self) {
        if let Some(parent) = self.dir.parent().map(Path::to_path_buf) {
            self.enter_dir(parent);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum FormField {
    #[default]
    Title,
    Description,
    CastText,
    Submit,
}

impl FormField {
    const ALL: [FormField; 4] = [
        FormField::Title,
        FormField::Description,
        FormField::CastText,
        FormField::Submit,
    ];

    fn label(self) -> &'static str {
        match self {
            FormField::Title => "Title",
            FormField::Description => "Description",
            FormField::CastText => "Cast text",
            FormField::Submit => "Publish",
        }
    }

    fn next(self) -> Self {
        match self {
            FormField::Title => FormField::Description,
            FormField::Description => FormField::CastText,
            FormField::CastText => FormField::Submit,
            FormField::Submit => FormField::Title,
        }
    }

    fn previous(self) -> Self {
        match self {
            FormField::Title => FormField::Submit,
            FormField::Description => FormField::Title,
            FormField::CastText => FormField::Description,
            FormField::Submit => FormField::CastText,
        }
    }
}

#[derive(Debug, Default)]
struct UploadForm {
    file: PathBuf,
    title: String,
    description: String,
    cast_text: String,
    active: FormField,
    error: Option<String>,
}

impl UploadForm {
    fn for_file(file: PathBuf) -> Self {
        let title = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            file,
            title,
            cast_text: DEFAULT_CAST_TEXT.to_string(),
            ..Self::default()
        }
    }

    fn active_value_mut(&mut self) -> Option<&mut String> {
        match self.active {
            FormField::Title => Some(&mut self.title),
            FormField::Description => Some(&mut self.description),
            FormField::CastText => Some(&mut self.cast_text),
            FormField::Submit => None,
        }
    }

    fn value(&self, field: FormField) -> &str {
        match field {
            FormField::Title => &self.title,
            FormField::Description => &self.description,
            FormField::CastText => &self.cast_text,
            FormField::Submit => "",
        }
    }

    fn insert_char(&mut self, ch: char) {
        if let Some(value) = self.active_value_mut() {
            value.push(ch);
        }
        self.error = None;
    }

    fn backspace(&mut self) {
        if let Some(value) = self.active_value_mut() {
            value.pop();
        }
        self.error = None;
    }

    fn clear_active(&mut self) {
        if let Some(value) = self.active_value_mut() {
            value.clear();
        }
        self.error = None;
    }

    fn request(&self) -> std::result::Result<UploadRequest, String> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err("A title is required.".to_string());
        }
        Ok(UploadRequest {
            file: self.file.clone(),
            title: Some(title.to_string()),
            description: self.description.trim().to_string(),
            cast_text: self.cast_text.trim().to_string(),
            ..UploadRequest::default()
        })
    }
}

/// What the list is overlaid with. The upload form only exists for a chosen file.
#[derive(Debug)]
enum Screen {
    List,
    FilePicker(FilePicker),
    Form(UploadForm),
}

enum AsyncResponse {
    Follows(std::result::Result<Vec<u64>, String>),
    Backfill {
        author: u64,
        result: std::result::Result<Vec<ResolvedCast>, String>,
    },
    Resolved {
        hash: String,
        result: std::result::Result<EnclosureMetadata, String>,
    },
    Progress {
        hash: String,
        progress: DownloadProgress,
    },
    Downloaded {
        hash: String,
        result: std::result::Result<PathBuf, String>,
    },
    UploadProgress {
        stage: UploadStage,
        done: u64,
        total: u64,
    },
    Uploaded(std::result::Result<Published, String>),
}

pub struct Options {
    pub hub: Arc<dyn Hub>,
    pub resolver: EnclosureResolver,
    pub handles: HandleDirectory,
    pub downloads: DownloadCoordinator,
    /// Enclosures are saved under `<download_root>/<handle>/`.
    pub download_root: PathBuf,
    /// The local identity; follow events are tracked for it.
    pub viewer: Option<u64>,
    /// Authors whose recent casts are loaded at start-up.
    pub backfill: Vec<u64>,
    /// Present only when an app key is configured.
    pub publisher: Option<Arc<Publisher>>,
    pub start_dir: PathBuf,
}

pub struct Model {
    hub: Arc<dyn Hub>,
    resolver: EnclosureResolver,
    handles: HandleDirectory,
    downloads: DownloadCoordinator,
    destinations: CheckpointStore,
    viewer: Option<u64>,
    backfill: Vec<u64>,
    publisher: Option<Arc<Publisher>>,
    start_dir: PathBuf,
    screen: Screen,
    items: Vec<CastItem>,
    seen: HashSet<String>,
    follows: HashSet<u64>,
    view: ListView,
    subscription: Option<Subscription>,
    status_message: String,
    in_flight: usize,
    uploading: bool,
    spinner: Spinner,
    needs_redraw: bool,
    response_tx: Sender<AsyncResponse>,
    response_rx: Receiver<AsyncResponse>,
}

impl Model {
    pub fn new(options: Options) -> Self {
        let (response_tx, response_rx) = unbounded();
        Self {
            hub: options.hub,
            resolver: options.resolver,
            handles: options.handles,
            downloads: options.downloads,
            destinations: CheckpointStore::new(options.download_root),
            viewer: options.viewer,
            backfill: options.backfill,
            publisher: options.publisher,
            start_dir: options.start_dir,
            screen: Screen::List,
            items: Vec::new(),
            seen: HashSet::new(),
            follows: HashSet::new(),
            view: ListView::default(),
            subscription: None,
            status_message: "Connecting to the hub…".to_string(),
            in_flight: 0,
            uploading: false,
            spinner: Spinner::new(),
            needs_redraw: true,
            response_tx,
            response_rx,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let mut stdout = io::stdout();
        enable_raw_mode()?;
        stdout.execute(EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        let result = self.start(&terminal).and_then(|_| self.event_loop(&mut terminal));

        disable_raw_mode()?;
        terminal.backend_mut().execute(LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        result
    }

    fn start(&mut self, terminal: &Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let size = terminal.size()?;
        self.view = ListView::new(size.height);

        let viewer = self.viewer.unwrap_or_default();
        let subscriber =
            LiveFeedSubscriber::new(self.hub.clone(), viewer).with_handles(self.handles.clone());
        match subscriber.start() {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                self.status_message = "Listening for new enclosures.".to_string();
            }
            Err(err) => {
                warn!(error = %err, "live feed unavailable");
                self.status_message = format!("Live feed unavailable: {err}");
            }
        }

        if let Some(viewer) = self.viewer {
            let hub = self.hub.clone();
            let tx = self.response_tx.clone();
            self.in_flight += 1;
            thread::spawn(move || {
                let result = LiveFeedSubscriber::new(hub, viewer)
                    .initial_follows(INITIAL_FOLLOWS_LIMIT)
                    .map_err(|err| err.to_string());
                let _ = tx.send(AsyncResponse::Follows(result));
            });
        }

        let authors = std::mem::take(&mut self.backfill);
        for author in authors {
            self.spawn_backfill(author);
        }
        Ok(())
    }

    fn spawn_backfill(&mut self, author: u64) {
        let walker = FeedWalker::new(self.hub.clone(), self.resolver.clone());
        let handles = self.handles.clone();
        let tx = self.response_tx.clone();
        self.in_flight += 1;
        thread::spawn(move || {
            let result = walker
                .recent_casts(author, BACKFILL_LIMIT)
                .map(|mut casts| {
                    casts.reverse();
                    for cast in &mut casts {
                        handles.warm(cast);
                    }
                    casts
                })
                .map_err(|err| err.to_string());
            let _ = tx.send(AsyncResponse::Backfill { author, result });
        });
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let mut last_tick = Instant::now();

        loop {
            if self.poll_async() {
                self.mark_dirty();
            }

            if self.needs_redraw {
                terminal.draw(|frame| self.draw(frame))?;
                self.needs_redraw = false;
            }

            let timeout = TICK_RATE
                .checked_sub(last_tick.elapsed())
                .unwrap_or_else(|| Duration::from_millis(16));

            if event::poll(timeout)? {
                match event::read()? {
                    Event::Key(key) if key.kind == KeyEventKind::Press => {
                        match self.handle_key(key) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(err) => {
                                self.status_message = format!("Error: {}", err);
                            }
                        }
                        self.mark_dirty();
                    }
                    Event::Resize(_, height) => {
                        self.view.resize(&self.items, height);
                        self.mark_dirty();
                    }
                    _ => {}
                }
            }

            if last_tick.elapsed() >= TICK_RATE {
                last_tick = Instant::now();
                if self.is_loading() {
                    if self.spinner.advance() {
                        self.mark_dirty();
                    }
                } else {
                    self.spinner.reset();
                }
            }
        }

        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.needs_redraw = true;
    }

    fn is_loading(&self) -> bool {
        self.in_flight > 0
    }

    fn poll_async(&mut self) -> bool {
        let mut changed = false;
        while let Ok(message) = self.response_rx.try_recv() {
            self.handle_async_response(message);
            changed = true;
        }
        let feed: Vec<FeedEvent> = match &self.subscription {
            Some(subscription) => subscription.events().try_iter().collect(),
            None => Vec::new(),
        };
        for event in feed {
            self.handle_feed_event(event);
            changed = true;
        }
        changed
    }

    fn handle_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::CastAdded(cast) => {
                let reference = cast.reference();
                if self.push_cast(cast) {
                    self.status_message = format!("New enclosure {reference}");
                }
            }
            FeedEvent::FollowAdded(fid) => {
                self.follows.insert(fid);
                self.status_message =
                    format!("Following @{}", self.handles.cached_or_unknown(fid));
                self.rerender_author(fid);
            }
            FeedEvent::FollowRemoved(fid) => {
                self.follows.remove(&fid);
                self.status_message =
                    format!("Unfollowed @{}", self.handles.cached_or_unknown(fid));
                self.rerender_author(fid);
            }
            FeedEvent::StreamFailed(reason) => {
                self.status_message = format!("Live feed stopped: {reason}");
            }
        }
    }

    fn handle_async_response(&mut self, message: AsyncResponse) {
        match message {
            AsyncResponse::Follows(result) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                match result {
                    Ok(follows) => {
                        self.follows.extend(follows);
                        for item in &mut self.items {
                            item.render(&self.handles, &self.follows);
                        }
                        self.view.refresh(&self.items);
                    }
                    Err(err) => warn!(error = %err, "could not load follows"),
                }
            }
            AsyncResponse::Backfill { author, result } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                match result {
                    Ok(casts) => {
                        let mut added = 0;
                        for cast in casts {
                            if self.push_cast(cast) {
                                added += 1;
                            }
                        }
                        info!(author, added, "backfill loaded");
                        self.status_message = format!(
                            "Loaded {added} enclosures from @{}.",
                            self.handles.cached_or_unknown(author)
                        );
                    }
                    Err(err) => {
                        self.status_message = format!("Could not load casts of {author}: {err}");
                    }
                }
            }
            AsyncResponse::Resolved { hash, result } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                let message = match &result {
                    Ok(meta) => format!("{} resolved. Press Enter again to download.", meta.filename),
                    Err(err) => format!("Could not resolve enclosure: {err}"),
                };
                self.update_item(&hash, |item| match result {
                    Ok(meta) => {
                        item.cast.enclosure = Some(meta);
                        item.status = ItemStatus::Idle;
                    }
                    Err(err) => item.status = ItemStatus::Failed(err),
                });
                self.status_message = message;
            }
            AsyncResponse::Progress { hash, progress } => {
                self.update_item(&hash, |item| item.status = ItemStatus::Downloading(progress));
            }
            AsyncResponse::Downloaded { hash, result } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.status_message = match &result {
                    Ok(path) => format!("Saved {}", path.display()),
                    Err(err) => format!("Download failed: {err}"),
                };
                self.update_item(&hash, |item| {
                    item.status = match result {
                        Ok(path) => ItemStatus::Saved(path),
                        Err(err) => ItemStatus::Failed(err),
                    }
                });
            }
            AsyncResponse::UploadProgress { stage, done, total } => {
                let what = match stage {
                    UploadStage::File => "file",
                    UploadStage::Artwork => "artwork",
                };
                let percent = if total == 0 {
                    0.0
                } else {
                    (done as f64 / total as f64 * 100.0).min(100.0)
                };
                self.status_message = format!("Uploading {what}… {percent:.0}%");
            }
            AsyncResponse::Uploaded(result) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.uploading = false;
                self.status_message = match result {
                    Ok(published) => format!(
                        "Published {} as cast {}",
                        published.metadata.filename, published.cast_hash
                    ),
                    Err(err) => format!("Upload failed: {err}"),
                };
            }
        }
    }

    /// Appends a cast unless it is already listed.
    fn push_cast(&mut self, cast: ResolvedCast) -> bool {
        if !self.seen.insert(cast.hash.clone()) {
            return false;
        }
        let mut item = CastItem::new(cast);
        item.render(&self.handles, &self.follows);
        self.items.push(item);
        self.view.refresh(&self.items);
        true
    }

    fn rerender_author(&mut self, fid: u64) {
        for item in self.items.iter_mut().filter(|item| item.cast.author_id == fid) {
            item.render(&self.handles, &self.follows);
        }
        self.view.refresh(&self.items);
    }

    fn update_item(&mut self, hash: &str, change: impl FnOnce(&mut CastItem)) {
        let Some(item) = self.items.iter_mut().find(|item| item.cast.hash == hash) else {
            return;
        };
        change(item);
        item.render(&self.handles, &self.follows);
        self.view.refresh(&self.items);
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Ok(true);
        }
        match self.screen {
            Screen::List => self.handle_list_key(key.code),
            Screen::FilePicker(_) => {
                self.handle_picker_key(key.code);
                Ok(false)
            }
            Screen::Form(_) => {
                self.handle_form_key(key.code);
                Ok(false)
            }
        }
    }

    fn handle_list_key(&mut self, code: KeyCode) -> Result<bool> {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(true),
            KeyCode::Down | KeyCode::Char('j') => self.view.move_down(&self.items),
            KeyCode::Up | KeyCode::Char('k') => self.view.move_up(&self.items),
            KeyCode::Enter | KeyCode::Right | KeyCode::Char('l') | KeyCode::Char('o') => {
                self.open_selected()
            }
            KeyCode::Char('u') => {
                if self.publisher.is_some() {
                    self.screen = Screen::FilePicker(FilePicker::open(&self.start_dir));
                } else {
                    self.status_message =
                        "No app key configured. Use `lemon3 config set account.private_key <hex>`."
                            .to_string();
                }
            }
            _ => {}
        }
        Ok(false)
    }

    /// First open resolves the enclosure metadata; the next one downloads it.
    fn open_selected(&mut self) {
        let cursor = self.view.cursor();
        let Some(item) = self.items.get_mut(cursor) else {
            return;
        };
        if item.status.is_busy() {
            self.status_message = "Already working on that one.".to_string();
            return;
        }
        let hash = item.cast.hash.clone();
        let tx = self.response_tx.clone();

        match item.cast.enclosure.clone() {
            None => {
                item.status = ItemStatus::Resolving;
                let resolver = self.resolver.clone();
                let cid = item.cast.enclosure_cid.clone();
                thread::spawn(move || {
                    let result = resolver.resolve(&cid).map_err(|err| err.to_string());
                    let _ = tx.send(AsyncResponse::Resolved { hash, result });
                });
                self.status_message = "Resolving enclosure…".to_string();
            }
            Some(meta) => {
                let dest = match self.destinations.author_dir(&item.cast.directory_name()) {
                    Ok(dest) => dest,
                    Err(err) => {
                        self.status_message = format!("Cannot save: {err}");
                        return;
                    }
                };
                item.status = ItemStatus::Downloading(DownloadProgress {
                    done: 0,
                    total: meta.size,
                });
                let downloads = self.downloads.clone();
                let status_message = format!("Downloading {}…", meta.filename);
                thread::spawn(move || {
                    let progress_tx = tx.clone();
                    let progress_hash = hash.clone();
                    let result = downloads
                        .download_enclosure(&meta, &dest, &mut |progress| {
                            let _ = progress_tx.send(AsyncResponse::Progress {
                                hash: progress_hash.clone(),
                                progress,
                            });
                        })
                        .map_err(|err| err.to_string());
                    let _ = tx.send(AsyncResponse::Downloaded { hash, result });
                });
                self.status_message = status_message;
            }
        }
        self.in_flight += 1;
        item.render(&self.handles, &self.follows);
        self.view.refresh(&self.items);
    }

    fn handle_picker_key(&mut self, code: KeyCode) {
        let Screen::FilePicker(picker) = &mut self.screen else {
            return;
        };
        match code {
            KeyCode::Esc | KeyCode::Char('q') => {
                self.screen = Screen::List;
                self.status_message = "Upload cancelled.".to_string();
            }
            KeyCode::Up | KeyCode::Char('k') => picker.move_up(),
            KeyCode::Down | KeyCode::Char('j') => picker.move_down(),
            KeyCode::Backspace | KeyCode::Left | KeyCode::Char('h') => picker.go_parent(),
            KeyCode::Enter | KeyCode::Right | KeyCode::Char('l') => {
                let Some(entry) = picker.selected().cloned() else {
                    return;
                };
                if entry.is_dir {
                    picker.enter_dir(entry.path);
                } else {
                    self.screen = Screen::Form(UploadForm::for_file(entry.path));
                }
            }
            _ => {}
        }
    }

    fn handle_form_key(&mut self, code: KeyCode) {
        let Screen::Form(form) = &mut self.screen else {
            return;
        };
        match code {
            KeyCode::Esc => {
                let dir = form
                    .file
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.start_dir.clone());
                self.screen = Screen::FilePicker(FilePicker::open(&dir));
            }
            KeyCode::Tab | KeyCode::Down => form.active = form.active.next(),
            KeyCode::BackTab | KeyCode::Up => form.active = form.active.previous(),
            KeyCode::Backspace => form.backspace(),
            KeyCode::Delete => form.clear_active(),
            KeyCode::Enter => {
                if form.active == FormField::Submit {
                    self.submit_upload();
                } else {
                    form.active = form.active.next();
                }
            }
            KeyCode::Char(ch) => form.insert_char(ch),
            _ => {}
        }
    }

    fn submit_upload(&mut self) {
        let Screen::Form(form) = &mut self.screen else {
            return;
        };
        if self.uploading {
            form.error = Some("An upload is already running.".to_string());
            return;
        }
        let Some(publisher) = self.publisher.clone() else {
            form.error = Some("No app key configured.".to_string());
            return;
        };
        let request = match form.request() {
            Ok(request) => request,
            Err(reason) => {
                form.error = Some(reason);
                return;
            }
        };
        let file = form.file.clone();
        let tx = self.response_tx.clone();
        self.uploading = true;
        self.in_flight += 1;
        thread::spawn(move || {
            let progress_tx = tx.clone();
            let result = publisher
                .publish(&request, &mut |stage, done, total| {
                    let _ = progress_tx.send(AsyncResponse::UploadProgress { stage, done, total });
                })
                .map_err(|err| err.to_string());
            let _ = tx.send(AsyncResponse::Uploaded(result));
        });
        self.status_message = format!("Uploading {}…", file.display());
        self.screen = Screen::List;
    }

    fn draw(&mut self, frame: &mut Frame<'_>) {
        let full = frame.size();
        frame.render_widget(Block::default().style(Style::default().bg(COLOR_BG)), full);

        let layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Length(1),
                Constraint::Min(0),
                Constraint::Length(1),
                Constraint::Length(1),
            ])
            .split(full);

        frame.render_widget(Paragraph::new(self.title_line()), layout[0]);
        self.draw_list(frame, layout[2]);

        let help = Paragraph::new(self.help_text())
            .style(
                Style::default()
                    .fg(COLOR_TEXT_SECONDARY)
                    .bg(COLOR_PANEL_BG)
                    .add_modifier(Modifier::ITALIC),
            )
            .alignment(Alignment::Center);
        frame.render_widget(help, layout[3]);

        let status_text = if self.is_loading() {
            format!("{} {}", self.spinner.frame(), self.status_message)
        } else {
            self.status_message.clone()
        };
        let status = Paragraph::new(status_text).style(
            Style::default()
                .fg(COLOR_TEXT_PRIMARY)
                .bg(COLOR_PANEL_FOCUSED_BG),
        );
        frame.render_widget(status, layout[4]);

        match &self.screen {
            Screen::List => {}
            Screen::FilePicker(picker) => draw_picker(frame, layout[2], picker),
            Screen::Form(form) => draw_form(frame, layout[2], form),
        }
    }

    fn title_line(&self) -> Line<'static> {
        let live = match self.subscription.as_ref().map(Subscription::state) {
            Some(StreamState::Connecting) => "connecting",
            Some(StreamState::Streaming) => "live",
            Some(StreamState::Closed) => "closed",
            Some(StreamState::Failed) | None => "offline",
        };
        Line::from(vec![
            Span::styled(
                " -- lemon3 -- ",
                Style::default()
                    .fg(COLOR_BG)
                    .bg(COLOR_LEMON)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!(
                    "  {} casts · {} follows · {live}",
                    self.items.len(),
                    self.follows.len()
                ),
                Style::default().fg(COLOR_TEXT_SECONDARY),
            ),
        ])
    }

    fn help_text(&self) -> &'static str {
        match self.screen {
            Screen::List => "j/k move · Enter resolve/download · u upload · q quit",
            Screen::FilePicker(_) => "j/k move · Enter open · h/Backspace parent · Esc cancel",
            Screen::Form(_) => "Tab next field · Enter on Publish submits · Esc back",
        }
    }

    fn draw_list(&self, frame: &mut Frame<'_>, area: Rect) {
        if self.items.is_empty() {
            let empty = Paragraph::new("No enclosures yet. New ones appear here as they are cast.")
                .style(
                    Style::default()
                        .fg(COLOR_TEXT_SECONDARY)
                        .add_modifier(Modifier::ITALIC),
                )
                .wrap(Wrap { trim: true });
            frame.render_widget(empty, area);
            return;
        }
        let mut lines: Vec<Line<'static>> = Vec::new();
        for index in self.view.visible(self.items.len()) {
            let item = &self.items[index];
            lines.extend(styled_block(&item.lines, index == self.view.cursor()));
            lines.push(Line::default());
        }
        frame.render_widget(Paragraph::new(Text::from(lines)), area);
    }
}

fn draw_picker(frame: &mut Frame<'_>, area: Rect, picker: &FilePicker) {
    let popup_area = centered_rect(70, 80, area);
    frame.render_widget(Clear, popup_area);
    let width = usize::from(popup_area.width.saturating_sub(6));

    let items: Vec<ListItem> = if let Some(err) = &picker.error {
        vec![ListItem::new(Line::from(Span::styled(
            err.clone(),
            Style::default().fg(COLOR_ERROR).bg(COLOR_PANEL_BG),
        )))]
    } else {
        picker
            .entries
            .iter()
            .map(|entry| {
                let (label, color) = if entry.is_dir {
                    (format!("{}/", entry.name), COLOR_ACCENT)
                } else {
                    (entry.name.clone(), COLOR_TEXT_PRIMARY)
                };
                ListItem::new(Line::from(Span::styled(
                    fit_width(&label, width),
                    Style::default().fg(color).bg(COLOR_PANEL_BG),
                )))
            })
            .collect()
    };

    let title = fit_width(
        &format!("Upload: {}", picker.dir.display()),
        usize::from(popup_area.width.saturating_sub(4)),
    );
    let list = List::new(items)
        .block(
            Block::default()
                .title(Span::styled(
                    title,
                    Style::default()
                        .fg(COLOR_ACCENT)
                        .add_modifier(Modifier::BOLD),
                ))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(COLOR_ACCENT))
                .style(Style::default().bg(COLOR_PANEL_BG)),
        )
        .highlight_style(
            Style::default()
                .fg(COLOR_TEXT_PRIMARY)
                .bg(COLOR_PANEL_SELECTED_BG)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("▶ ");

    let mut state = ListState::default();
    if picker.error.is_none() && !picker.entries.is_empty() {
        state.select(Some(picker.selected));
    }
    frame.render_stateful_widget(list, popup_area, &mut state);
}

fn draw_form(frame: &mut Frame<'_>, area: Rect, form: &UploadForm) {
    let popup_area = centered_rect(70, 60, area);
    frame.render_widget(Clear, popup_area);

    let mut lines = vec![
        Line::from(Span::styled(
            format!("File: {}", form.file.display()),
            Style::default().fg(COLOR_TEXT_SECONDARY),
        )),
        Line::default(),
    ];
    for field in FormField::ALL {
        let active = form.active == field;
        let indicator = Span::styled(
            if active { "> " } else { "  " },
            Style::default().fg(COLOR_ACCENT).add_modifier(Modifier::BOLD),
        );
        if field == FormField::Submit {
            let mut style = Style::default().fg(COLOR_ACCENT);
            if active {
                style = style.add_modifier(Modifier::BOLD | Modifier::REVERSED);
            }
            lines.push(Line::default());
            lines.push(Line::from(vec![
                indicator,
                Span::styled(format!("[ {} ]", field.label()), style),
            ]));
            continue;
        }
        let value = form.value(field);
        let shown = if value.is_empty() && !active {
            Span::styled(
                "(empty)",
                Style::default()
                    .fg(COLOR_TEXT_SECONDARY)
                    .add_modifier(Modifier::ITALIC),
            )
        } else {
            let cursor = if active { "▏" } else { "" };
            Span::styled(
                format!("{value}{cursor}"),
                Style::default().fg(COLOR_TEXT_PRIMARY),
            )
        };
        lines.push(Line::from(vec![
            indicator,
            Span::styled(
                format!("{}: ", field.label()),
                Style::default().fg(COLOR_TEXT_SECONDARY),
            ),
            shown,
        ]));
    }
    if let Some(err) = &form.error {
        lines.push(Line::default());
        lines.push(Line::from(Span::styled(
            err.clone(),
            Style::default().fg(COLOR_ERROR),
        )));
    }

    let paragraph = Paragraph::new(Text::from(lines))
        .block(
            Block::default()
                .title(Span::styled(
                    "New enclosure",
                    Style::default()
                        .fg(COLOR_ACCENT)
                        .add_modifier(Modifier::BOLD),
                ))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(COLOR_ACCENT))
                .style(Style::default().bg(COLOR_PANEL_BG)),
        )
        .wrap(Wrap { trim: false });
    frame.render_widget(paragraph, popup_area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cast::PROTOCOL_EPOCH;
    use crate::enclosure::Link;
    use crate::storage::MemoryCache;
    use crate::testing::{FakeHub, FakeStorage};
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn cast() -> ResolvedCast {
        ResolvedCast {
            author_id: 3,
            author_handle: "alice".into(),
            timestamp: PROTOCOL_EPOCH,
            hash: "0xabc".into(),
            text: "hi  there".into(),
            mentions: vec![9],
            mention_positions: vec![3],
            enclosure_cid: "bafymeta".into(),
            ..ResolvedCast::default()
        }
    }

    fn model() -> (Model, Arc<FakeStorage>, TempDir) {
        let hub = Arc::new(FakeHub::default());
        hub.add_user("alice", 3);
        let storage = Arc::new(FakeStorage::default());
        storage.put_document(
            "bafymeta",
            json!({"enclosed": {"/": "bafyfile"}, "filename": "song.mp3", "size": 4}),
        );
        storage.put_bytes("bafyfile", b"song");
        let cache = Arc::new(MemoryCache::new());
        let resolver = EnclosureResolver::new(storage.clone(), cache.clone());
        let dir = tempdir().unwrap();
        let mut model = Model::new(Options {
            hub: hub.clone(),
            resolver: resolver.clone(),
            handles: HandleDirectory::new(hub, cache),
            downloads: DownloadCoordinator::new(storage.clone(), resolver),
            download_root: dir.path().join("downloads"),
            viewer: None,
            backfill: Vec::new(),
            publisher: None,
            start_dir: dir.path().to_path_buf(),
        });
        model.view = ListView::new(40);
        (model, storage, dir)
    }

    fn settle(model: &mut Model) {
        while model.in_flight > 0 {
            let message = model
                .response_rx
                .recv_timeout(Duration::from_secs(5))
                .unwrap();
            model.handle_async_response(message);
        }
    }

    #[test]
    fn listing_casts_reads_no_metadata() {
        let (mut model, storage, _dir) = model();
        let mut other = cast();
        other.hash = "0xdef".into();
        other.enclosure_cid = "bafyother".into();

        assert!(model.push_cast(cast()));
        assert_eq!(model.view.visible(model.items.len()), 0..1);
        assert!(model.push_cast(other));
        assert!(!model.push_cast(cast()));
        assert_eq!(model.items.len(), 2);
        assert_eq!(model.view.visible(model.items.len()), 0..2);
        assert_eq!(storage.dag_reads(), 0);
    }

    #[test]
    fn first_open_resolves_and_second_downloads() {
        let (mut model, storage, dir) = model();
        let mut other = cast();
        other.hash = "0xdef".into();
        other.enclosure_cid = "bafyother".into();
        model.push_cast(cast());
        model.push_cast(other);

        model.open_selected();
        assert_eq!(model.items[0].status, ItemStatus::Resolving);
        settle(&mut model);
        assert_eq!(storage.dag_reads(), 1);
        assert!(storage.was_read("bafymeta"));
        assert!(model.items[0].cast.enclosure.is_some());
        assert!(model.items[1].cast.enclosure.is_none());
        assert!(model.items[0].lines.iter().any(|line| line.contains("song.mp3")));

        model.open_selected();
        settle(&mut model);
        let saved = dir.path().join("downloads").join("alice").join("song.mp3");
        assert_eq!(model.items[0].status, ItemStatus::Saved(saved.clone()));
        assert_eq!(fs::read(&saved).unwrap(), b"song");
        assert_eq!(storage.dag_reads(), 1);
    }

    #[test]
    fn unknown_authors_download_into_a_fid_directory() {
        let (mut model, _storage, dir) = model();
        let mut anonymous = cast();
        anonymous.author_id = 9;
        anonymous.author_handle.clear();
        anonymous.enclosure = Some(EnclosureMetadata {
            filename: "song.mp3".into(),
            size: 4,
            enclosed: Link::new("bafyfile"),
            ..EnclosureMetadata::default()
        });
        model.push_cast(anonymous);

        model.open_selected();
        settle(&mut model);
        let saved = dir.path().join("downloads").join("fid-9").join("song.mp3");
        assert_eq!(model.items[0].status, ItemStatus::Saved(saved.clone()));
        assert!(saved.exists());
    }

    #[test]
    fn upload_needs_an_app_key() {
        let (mut model, _storage, _dir) = model();
        assert!(!model.handle_list_key(KeyCode::Char('u')).unwrap());
        assert!(matches!(model.screen, Screen::List));
    }

    #[test]
    fn picker_and_form_carry_their_own_state() {
        let (mut model, _storage, dir) = model();
        fs::write(dir.path().join("track.mp3"), "t").unwrap();
        model.screen = Screen::FilePicker(FilePicker::open(dir.path()));

        model.handle_picker_key(KeyCode::Down);
        model.handle_picker_key(KeyCode::Enter);
        match &model.screen {
            Screen::Form(form) => {
                assert_eq!(form.file, dir.path().join("track.mp3"));
                assert_eq!(form.title, "track.mp3");
            }
            other => panic!("expected the upload form, got {other:?}"),
        }

        model.handle_form_key(KeyCode::Esc);
        match &model.screen {
            Screen::FilePicker(picker) => assert_eq!(picker.dir, dir.path()),
            other => panic!("expected the file picker, got {other:?}"),
        }

        model.handle_picker_key(KeyCode::Esc);
        assert!(matches!(model.screen, Screen::List));
        assert_eq!(model.status_message, "Upload cancelled.");
    }

    #[test]
    fn unresolved_cast_renders_as_a_box() {
        let lines = cast_lines(&cast(), &ItemStatus::Idle, false, |_| "bob".into());
        assert_eq!(
            lines,
            vec![
                "┌─ @alice/0xabc [2021-01-01 00:00]",
                "│ hi @bob there",
                "│ ----",
                "│ lemon3+ipfs://bafymeta",
                "└───",
            ]
        );
    }

    #[test]
    fn resolved_cast_shows_metadata_and_status() {
        let mut cast = cast();
        cast.text.clear();
        cast.enclosure = Some(EnclosureMetadata {
            filename: "song.mp3".into(),
            mime_type: "audio/mpeg".into(),
            description: "a tune".into(),
            size: 10,
            enclosed: Link::new("bafyfile"),
            ..EnclosureMetadata::default()
        });
        let status = ItemStatus::Downloading(DownloadProgress { done: 5, total: 10 });
        let lines = cast_lines(&cast, &status, true, |_| "bob".into());
        assert!(lines[0].contains("★"));
        assert_eq!(lines[1], "│ ----");
        assert!(lines[2].starts_with("│ song.mp3 ("));
        assert!(lines[2].ends_with(", audio/mpeg)"));
        assert_eq!(lines[3], "│ a tune");
        assert_eq!(lines[5], "│ downloading 50%");
        assert_eq!(lines.len(), 7);
    }

    #[test]
    fn long_text_wraps() {
        let mut cast = cast();
        cast.mentions.clear();
        cast.mention_positions.clear();
        cast.text = "word ".repeat(40);
        let lines = cast_lines(&cast, &ItemStatus::Idle, false, |_| String::new());
        assert!(lines.len() > 5);
        assert!(lines
            .iter()
            .all(|line| UnicodeWidthStr::width(line.as_str()) <= WRAP_WIDTH + 4));
    }

    #[test]
    fn fit_width_truncates_with_ellipsis() {
        assert_eq!(fit_width("short", 10), "short");
        assert_eq!(fit_width("abcdefghij", 5), "abcd…");
    }

    #[test]
    fn picker_lists_directories_first_and_hides_dotfiles() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("A.txt"), "a").unwrap();
        fs::write(dir.path().join(".hidden"), "h").unwrap();
        fs::create_dir(dir.path().join("zdir")).unwrap();

        let mut picker = FilePicker::open(dir.path());
        let names: Vec<&str> = picker.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["..", "zdir", "A.txt", "b.txt"]);

        picker.move_down();
        assert_eq!(picker.selected().unwrap().name, "zdir");
        let sub = picker.selected().unwrap().path.clone();
        picker.enter_dir(sub);
        assert_eq!(picker.entries.len(), 1);
        picker.go_parent();
        assert_eq!(picker.dir, dir.path());
    }

    #[test]
    fn form_requires_a_title() {
        let mut form = UploadForm::for_file(PathBuf::from("/tmp/track.mp3"));
        assert_eq!(form.title, "track.mp3");
        assert_eq!(form.cast_text, DEFAULT_CAST_TEXT);

        form.clear_active();
        assert!(form.request().is_err());

        for ch in "Track".chars() {
            form.insert_char(ch);
        }
        form.active = form.active.next();
        for ch in "desc".chars() {
            form.insert_char(ch);
        }
        form.backspace();
        let request = form.request().unwrap();
        assert_eq!(request.title.as_deref(), Some("Track"));
        assert_eq!(request.description, "des");
        assert_eq!(request.file, PathBuf::from("/tmp/track.mp3"));
    }

    #[test]
    fn form_fields_cycle() {
        let mut field = FormField::default();
        for _ in 0..FormField::ALL.len() {
            field = field.next();
        }
        assert_eq!(field, FormField::Title);
        assert_eq!(FormField::Title.previous(), FormField::Submit);
    }
}
