mod backend;
mod cli;
mod commands;
mod env_loader;
mod error;
mod logging;
mod watchd;

fn main() {
    let dotenv = env_loader::load_dotenv();
    logging::init();
    tracing::debug!(?dotenv, "environment loaded");
    if let Err(err) = cli::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
