#[tokio::main]
async fn main() {
    if let Err(e) = webclaw::run().await {
        tracing::error!(error = %e, "webclaw exited with an error");
        eprintln!("webclaw: {e}");
        std::process::exit(1);
    }
}
