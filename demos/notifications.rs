use std::error::Error;
use std::time::Duration;

use pushline_sdk::stream::client::StreamClient;
use pushline_sdk::stream::notifications::{NoticeLevel, NotificationChannel};
use pushline_sdk::SessionContext;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let access_token = "REPLACE_WITH_ACCESS_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = StreamClient::new("https://app.example.com")?.with_local_mode(true);
        let context = SessionContext::with_credential(SecretString::new(access_token));
        let (channel, mut notices) = NotificationChannel::subscribe(&client, &context);

        let listen = async {
            while let Some(notice) = notices.recv().await {
                match notice.level {
                    NoticeLevel::Success => println!("ok: {}", notice.message),
                    NoticeLevel::Error => println!("error: {}", notice.message),
                }
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(300), listen).await;

        println!("state={:?}", channel.state());
        context.revoke();
        channel.close().await;

        Ok::<(), Box<dyn Error>>(())
    })
}
