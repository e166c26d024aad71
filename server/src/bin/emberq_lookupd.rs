use emberq_server::app::LookupApp;

#[tokio::main]
async fn main() {
    if let Err(e) = LookupApp::run().await {
        eprintln!("\nError: {}\n", e);
        std::process::exit(1);
    }
}
