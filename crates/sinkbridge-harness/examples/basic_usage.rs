//! Minimal writer bridge walkthrough: producers on one side, a forwarding
//! delegate on the other, with one back-pressure window in between.

use std::time::Duration;

use sinkbridge_core::{create_writer, WriterConfig};
use sinkbridge_harness::{DelegateEvent, ForwardingDelegate};

#[tokio::main]
async fn main() {
    let (delegate, mut events) = ForwardingDelegate::<String>::channel();
    let (writer, sink) = create_writer(&WriterConfig::paused(), delegate);

    // Producers submit while the sink is paused; both suspend.
    let producer = tokio::spawn({
        let writer = writer.clone();
        async move {
            writer.write("hello".to_string()).await.unwrap();
            writer.write("world".to_string()).await.unwrap();
        }
    });

    // Give the producer a moment to park, then open the window.
    tokio::time::sleep(Duration::from_millis(20)).await;
    sink.set_writability(true);

    producer.await.unwrap();
    writer.finish();

    while let Some(event) = events.recv().await {
        match event {
            DelegateEvent::Batch(elements) => println!("delivered: {elements:?}"),
            DelegateEvent::Terminated(error) => {
                println!("terminated: {error:?}");
                break;
            }
        }
    }
}
