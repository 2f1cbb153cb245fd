use std::error::Error;

use pushline_sdk::stream::chat::{ChatMessage, ChatRequest, ChatStream, SourceEntry};
use pushline_sdk::stream::client::StreamClient;
use pushline_sdk::stream::session::CancelHandle;
use pushline_sdk::SessionContext;
use secrecy::SecretString;
use tokio::sync::watch;
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
        let chat = ChatStream::new(client, context);

        let (message_tx, mut message_rx) = watch::channel(ChatMessage::pending());
        let printer = tokio::spawn(async move {
            let mut printed = 0;
            while message_rx.changed().await.is_ok() {
                let message = message_rx.borrow_and_update().clone();
                if message.content.len() > printed {
                    print!("{}", &message.content[printed..]);
                    printed = message.content.len();
                }
                if let Some(sources) = message.sources.as_ref().filter(|_| !message.streaming) {
                    println!();
                    for entry in sources {
                        match entry {
                            SourceEntry::Document(source) => println!(
                                "source title={} url={}",
                                source.title.as_deref().unwrap_or("-"),
                                source.url.as_deref().unwrap_or("-"),
                            ),
                            SourceEntry::Other(value) => println!("source {value}"),
                        }
                    }
                }
            }
        });

        let end = chat
            .send(
                &ChatRequest::new("Summarize last month's spending"),
                &message_tx,
                &CancelHandle::new(),
            )
            .await?;
        drop(message_tx);
        let _ = printer.await;
        println!("\nended={end:?}");

        Ok::<(), Box<dyn Error>>(())
    })
}
