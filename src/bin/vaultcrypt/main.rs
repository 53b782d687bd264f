use env_logger::Env;

fn main() {
    init_logger();
    let code = vaultcrypt::cli::run();
    std::process::exit(code);
}

fn init_logger() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}
