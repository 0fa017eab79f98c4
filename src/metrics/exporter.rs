use crate::metrics::collector;
use crate::Result;
use prometheus::Registry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Serves the text exposition format to any HTTP GET on the listener.
pub struct PrometheusExporter {
    registry: Registry,
    listener: TcpListener,
}

impl PrometheusExporter {
    pub async fn bind(registry: Registry, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Prometheus exporter listening on {}", listener.local_addr()?);
        Ok(Self { registry, listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "metrics scrape");
                        if let Err(e) = self.respond(stream).await {
                            warn!(%peer, error = %e, "metrics response failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "metrics accept failed"),
                },
            }
        }
        info!("Prometheus exporter stopped");
    }

    async fn respond(&self, mut stream: TcpStream) -> Result<()> {
        // The request itself is not inspected; every path gets the metrics.
        let mut request = [0u8; 1024];
        let _ = stream.read(&mut request).await?;

        let body = collector::encode(&self.registry)?;
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;

    #[tokio::test]
    async fn test_scrape_returns_exposition() {
        let collector = MetricsCollector::new().unwrap();
        collector
            .channels()
            .for_channel("c1")
            .records_written
            .inc_by(2);

        let exporter = PrometheusExporter::bind(collector.registry().clone(), "127.0.0.1:0")
            .await
            .unwrap();
        let addr = exporter.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(exporter.serve(cancel.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("flowacct_channel_records_written_total{channel=\"c1\"} 2"));

        cancel.cancel();
        server.await.unwrap();
    }
}
