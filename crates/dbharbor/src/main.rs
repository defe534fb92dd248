mod cli;
mod setup;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    std::process::exit(cli::run(&args));
}
