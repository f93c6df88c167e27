//! Binary entrypoint for the decompbox tool

#[tokio::main]
async fn main() {
    if let Err(e) = decompbox::cli::run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
