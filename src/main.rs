use clap::Parser;

fn main() {
    let cli = lemon3::Cli::parse();
    if let Err(err) = lemon3::run(cli) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}
