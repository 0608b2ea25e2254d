#[rocket::main]
async fn main() {
    if let Err(e) = admp_hub::rocket().launch().await {
        eprintln!("🔥 admp-hub failed to launch: {e}");
    }
}
