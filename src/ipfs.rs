use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::USER_AGENT;
use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:5001/api/v0";
const COPY_CHUNK: usize = 64 * 1024;

/// Progress callback: bytes done, bytes expected (0 when unknown).
pub type Progress<'a> = &'a mut dyn FnMut(u64, u64);

/// The content-addressed storage node.
pub trait ObjectStore: Send + Sync {
    fn put_object(&self, bytes: &[u8]) -> Result<String>;
    fn add_file(&self, path: &Path, progress: Progress<'_>) -> Result<String>;
    fn get_object(&self, cid: &str) -> Result<Vec<u8>>;
    /// Streams an object into `path` and returns the number of bytes written.
    fn get_object_to_file(
        &self,
        cid: &str,
        path: &Path,
        expected_size: u64,
        progress: Progress<'_>,
    ) -> Result<u64>;
    fn put_dag(&self, doc: &Map<String, Value>) -> Result<String>;
    fn get_dag(&self, cid: &str) -> Result<Map<String, Value>>;
    fn pin(&self, cid: &str) -> Result<()>;
    fn ping(&self) -> Result<()>;
}

/// Kubo RPC client (`/api/v0`). Every RPC call is a POST.
pub struct KuboClient {
    http: HttpClient,
    base_url: Url,
    user_agent: String,
}

impl KuboClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let base_url = Url::parse(&format!("{}/", api_url.trim_end_matches('/')))
            .map_err(|err| Error::transport(format!("ipfs: invalid api url {api_url}"), err))?;
        // Transfers are unbounded; only connecting is.
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Option::<Duration>::None)
            .build()
            .map_err(|err| Error::transport("ipfs: build http client", err))?;
        Ok(Self {
            http,
            base_url,
            user_agent: format!("lemon3/{}", crate::VERSION),
        })
    }

    fn endpoint(&self, command: &str, args: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .base_url
            .join(command)
            .map_err(|err| Error::transport(format!("ipfs: build url {command}"), err))?;
        if !args.is_empty() {
            url.query_pairs_mut().extend_pairs(args.iter().copied());
        }
        Ok(url)
    }

    fn call(&self, command: &str, args: &[(&str, &str)], form: Option<Form>) -> Result<Response> {
        let url = self.endpoint(command, args)?;
        let mut request = self.http.post(url).header(USER_AGENT, &self.user_agent);
        if let Some(form) = form {
            request = request.multipart(form);
        }
        let response = request
            .send()
            .map_err(|err| Error::transport(format!("ipfs: {command}"), err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::transport(
                format!("ipfs: {command}"),
                format!("{status} - {}", body.trim()),
            ));
        }
        Ok(response)
    }

    fn call_json<T: serde::de::DeserializeOwned>(
        &self,
        command: &str,
        args: &[(&str, &str)],
        form: Option<Form>,
    ) -> Result<T> {
        self.call(command, args, form)?
            .json()
            .map_err(|err| Error::transport(format!("ipfs: decode {command}"), err))
    }
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Debug, Deserialize)]
struct DagPutResponse {
    #[serde(rename = "Cid")]
    cid: DagPutCid,
}

#[derive(Debug, Deserialize)]
struct DagPutCid {
    #[serde(rename = "/")]
    root: String,
}

/// Counts bytes as the multipart body is read and reports them on a channel.
struct CountingReader<R> {
    inner: R,
    read: u64,
    report: Sender<u64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        let _ = self.report.send(self.read);
        Ok(n)
    }
}

impl ObjectStore for KuboClient {
    fn put_object(&self, bytes: &[u8]) -> Result<String> {
        let form = Form::new().part("file", Part::bytes(bytes.to_vec()).file_name("data"));
        let added: AddResponse = self.call_json("add", &[], Some(form))?;
        Ok(added.hash)
    }

    fn add_file(&self, path: &Path, progress: Progress<'_>) -> Result<String> {
        let file = File::open(path)
            .map_err(|err| Error::local_state(format!("open {}", path.display()), err))?;
        let total = file
            .metadata()
            .map_err(|err| Error::local_state(format!("stat {}", path.display()), err))?
            .len();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let (report, updates) = crossbeam_channel::unbounded();
        let reader = CountingReader {
            inner: file,
            read: 0,
            report,
        };
        let form = Form::new().part("file", Part::reader_with_length(reader, total).file_name(name));

        // The request owns the reader; the channel closes once the body is dropped.
        let added: Result<AddResponse> = thread::scope(|scope| {
            let upload = scope.spawn(move || self.call_json("add", &[], Some(form)));
            for done in updates.iter() {
                progress(done, total);
            }
            upload
                .join()
                .unwrap_or_else(|_| Err(Error::transport("ipfs: add", "upload thread panicked")))
        });
        Ok(added?.hash)
    }

    fn get_object(&self, cid: &str) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        self.call("cat", &[("arg", cid)], None)?
            .read_to_end(&mut body)
            .map_err(|err| Error::transport(format!("ipfs: cat {cid}"), err))?;
        Ok(body)
    }

    fn get_object_to_file(
        &self,
        cid: &str,
        path: &Path,
        expected_size: u64,
        progress: Progress<'_>,
    ) -> Result<u64> {
        let mut response = self.call("cat", &[("arg", cid)], None)?;
        let mut file = File::create(path)
            .map_err(|err| Error::local_state(format!("create {}", path.display()), err))?;
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut written = 0u64;
        loop {
            let n = response
                .read(&mut buf)
                .map_err(|err| Error::transport(format!("ipfs: cat {cid}"), err))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .map_err(|err| Error::local_state(format!("write {}", path.display()), err))?;
            written += n as u64;
            progress(written, expected_size);
        }
        file.flush()
            .map_err(|err| Error::local_state(format!("flush {}", path.display()), err))?;
        Ok(written)
    }

    fn put_dag(&self, doc: &Map<String, Value>) -> Result<String> {
        let payload = serde_json::to_vec(doc)
            .map_err(|err| Error::transport("ipfs: encode dag document", err))?;
        let form = Form::new().part("file", Part::bytes(payload).file_name("data.json"));
        let put: DagPutResponse = self.call_json(
            "dag/put",
            &[("store-codec", "dag-cbor"), ("input-codec", "json")],
            Some(form),
        )?;
        Ok(put.cid.root)
    }

    fn get_dag(&self, cid: &str) -> Result<Map<String, Value>> {
        let value: Value = self.call_json("dag/get", &[("arg", cid)], None)?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(Error::malformed_metadata(
                cid,
                format!("expected a map, got {}", json_kind(&other)),
            )),
        }
    }

    fn pin(&self, cid: &str) -> Result<()> {
        self.call("pin/add", &[("arg", cid)], None).map(drop)
    }

    fn ping(&self) -> Result<()> {
        self.call("id", &[], None).map(drop)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a map",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_keep_the_api_prefix() {
        let client = KuboClient::new("http://127.0.0.1:5001/api/v0/").unwrap();
        let url = client
            .endpoint("dag/get", &[("arg", "bafy abc")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:5001/api/v0/dag/get?arg=bafy+abc"
        );
    }

    #[test]
    fn counting_reader_reports_running_total() {
        let (report, updates) = crossbeam_channel::unbounded();
        let mut reader = CountingReader {
            inner: &b"hello world"[..],
            read: 0,
            report,
        };
        let mut buf = [0u8; 4];
        while reader.read(&mut buf).unwrap() > 0 {}
        drop(reader);
        let seen: Vec<u64> = updates.iter().collect();
        assert_eq!(seen.last(), Some(&11));
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn dag_put_response_shape() {
        let put: DagPutResponse =
            serde_json::from_str(r#"{"Cid": {"/": "bafyreib"}}"#).unwrap();
        assert_eq!(put.cid.root, "bafyreib");
    }
}
