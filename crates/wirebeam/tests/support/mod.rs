#![allow(clippy::unwrap_used)]
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use wirebeam::consumer::{ProtocolConsumer, RequestHandler};
use wirebeam::event::EventOutcome;
use wirebeam::producer::ConsumerFactory;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Echoes everything it reads and finishes the request on a newline.
///
/// Residual bytes after the newline go back to the connection, which serves
/// them with a fresh consumer.
pub struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn data_received(&mut self, consumer: &ProtocolConsumer, data: Bytes) -> anyhow::Result<Option<Bytes>> {
        match data.iter().position(|&byte| byte == b'\n') {
            Some(newline) => {
                consumer.write(data.slice(..=newline))?;
                let residual = data.slice(newline + 1..);
                consumer.finished(EventOutcome::default());
                Ok((!residual.is_empty()).then_some(residual))
            }
            None => {
                consumer.write(data)?;
                Ok(None)
            }
        }
    }
}

pub fn echo_factory() -> ConsumerFactory {
    Arc::new(|| ProtocolConsumer::new(Box::new(EchoHandler)))
}

/// A line-oriented client handler: `start_request` writes the request, the
/// response is collected until a newline finishes the exchange.
pub struct LineClientHandler {
    pub label: &'static str,
    pub lines: Arc<Mutex<Vec<(&'static str, String)>>>,
}

impl RequestHandler for LineClientHandler {
    fn data_received(&mut self, consumer: &ProtocolConsumer, data: Bytes) -> anyhow::Result<Option<Bytes>> {
        match data.iter().position(|&byte| byte == b'\n') {
            Some(newline) => {
                let line = String::from_utf8_lossy(&data[..newline]).into_owned();
                self.lines.lock().push((self.label, line));
                let residual = data.slice(newline + 1..);
                consumer.finished(EventOutcome::default());
                Ok((!residual.is_empty()).then_some(residual))
            }
            None => Ok(None),
        }
    }

    fn start_request(&mut self, consumer: &ProtocolConsumer) -> anyhow::Result<()> {
        let request = consumer.request().expect("client consumer started with a request");
        consumer.write(request)?;
        Ok(())
    }
}

pub fn line_client_factory(
    label: &'static str,
    lines: Arc<Mutex<Vec<(&'static str, String)>>>,
) -> ConsumerFactory {
    Arc::new(move || {
        ProtocolConsumer::new(Box::new(LineClientHandler {
            label,
            lines: Arc::clone(&lines),
        }))
    })
}
