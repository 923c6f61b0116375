use chrono::Utc;
use log::warn;
use std::sync::Arc;
use uuid::Uuid;

/// Callback invoked after every successful chunk transfer with the
/// replica's location, length and offset.
pub type ProgressFn = Arc<dyn Fn(&str, u64, u64) + Send + Sync>;

/// Best-effort visualization sink.
///
/// Registration failures disable the sink for the rest of the transfer;
/// progress failures are logged and swallowed. Nothing here can fail a
/// transfer.
pub struct VizSink {
    client: reqwest::Client,
    url: String,
    session_id: String,
}

impl VizSink {
    /// Registers a transfer with the endpoint. Returns `None` when no
    /// endpoint is configured or registration fails.
    pub async fn register(
        url: Option<&str>,
        filename: &str,
        size: u64,
        connections: usize,
    ) -> Option<VizSink> {
        let url = url?;
        let sink = VizSink {
            client: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
            session_id: Uuid::new_v4().simple().to_string(),
        };
        let msg = serde_json::json!({
            "session_id": sink.session_id,
            "filename": filename,
            "size": size,
            "connections": connections,
            "timestamp_ms": Utc::now().timestamp_millis(),
        });
        if let Err(err) = sink.post("register", &msg).await {
            warn!("visualization registration failed: {err}");
            return None;
        }
        Some(sink)
    }

    pub async fn progress(&self, host: &str, length: u64, offset: u64) {
        let msg = serde_json::json!({
            "session_id": self.session_id,
            "host": host,
            "length": length,
            "offset": offset,
            "timestamp_ms": Utc::now().timestamp_millis(),
        });
        if let Err(err) = self.post("progress", &msg).await {
            warn!("visualization progress failed: {err}");
        }
    }

    pub async fn clear(&self) {
        let msg = serde_json::json!({ "session_id": self.session_id });
        if let Err(err) = self.post("clear", &msg).await {
            warn!("visualization clear failed: {err}");
        }
    }

    async fn post(&self, kind: &str, msg: &serde_json::Value) -> reqwest::Result<()> {
        self.client
            .post(format!("{}/{kind}", self.url))
            .json(msg)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// The `host:port` component of a depot or allocation URI.
pub(crate) fn host_of(location: &str) -> &str {
    let rest = match location.split_once("//") {
        Some((_, rest)) => rest,
        None => location,
    };
    rest.split('/').next().unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("posix://node1:6714"), "node1:6714");
        assert_eq!(host_of("mem://cache:1/extra"), "cache:1");
        assert_eq!(host_of("bare-host:80"), "bare-host:80");
    }
}
