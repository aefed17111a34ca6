use env_logger::Env;

mod app;
mod prelude;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::builder()
        .parse_env(Env::new().filter_or("PROCWATCH_LOG", "info"))
        .format_timestamp(None)
        .init();

    match app::run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            std::process::exit(1);
        }
    }
}
