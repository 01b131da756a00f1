//! Talk to a bytepipe server from tokio using `MessageCodec`.
//!
//! Start a server first:
//!   cargo run --features cli -- echo 127.0.0.1:7070
//!
//! Then run:
//!   cargo run --example async-client --features async -- 127.0.0.1:7070

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use bytepipe::socket::MessageCodec;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7070".to_string());
    let stream = TcpStream::connect(&addr).await?;
    let mut framed = Framed::new(stream, MessageCodec::new());

    for text in ["hello", "", "goodbye"] {
        framed.send(Bytes::from(text)).await?;
        match framed.next().await {
            Some(reply) => println!("{:?}", String::from_utf8_lossy(&reply?)),
            None => break,
        }
    }
    Ok(())
}
