use lumen_server::{AppConfig, init_tracing, serve};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    init_tracing(&config.logging.level);

    if let Err(err) = serve(config).await {
        eprintln!("server error: {err}");
        std::process::exit(1);
    }
}
