use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{Notification, Notifier};
use crate::error::NotifyError;
use crate::watchlist::SubscriberId;

#[derive(Deserialize)]
struct DmChannel {
    id: String,
}

/// Delivers notifications as Discord direct messages through the REST API.
/// DM channel ids are looked up once per subscriber and cached.
pub struct DiscordNotifier {
    client: Client,
    api_base: String,
    auth: String,
    dm_channels: DashMap<SubscriberId, String>,
}

impl DiscordNotifier {
    pub fn new(api_base: &str, bot_token: &str) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(DiscordNotifier {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            auth: format!("Bot {}", bot_token),
            dm_channels: DashMap::new(),
        })
    }

    async fn dm_channel(&self, user: &SubscriberId) -> Result<String, NotifyError> {
        if let Some(id) = self.dm_channels.get(user) {
            return Ok(id.clone());
        }
        let resp = self
            .client
            .post(format!("{}/users/@me/channels", self.api_base))
            .header(reqwest::header::AUTHORIZATION, &self.auth)
            .json(&json!({ "recipient_id": user.as_str() }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let channel: DmChannel = resp.json().await?;
        debug!(target: "fanout_notify", subscriber = %user, channel = %channel.id, "dm_channel_opened");
        self.dm_channels.insert(user.clone(), channel.id.clone());
        Ok(channel.id)
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let channel_id = self.dm_channel(&notification.subscriber_id).await?;
        let resp = self
            .client
            .post(format!("{}/channels/{}/messages", self.api_base, channel_id))
            .header(reqwest::header::AUTHORIZATION, &self.auth)
            .json(&json!({ "content": notification.text }))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tick;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    type Seen = Arc<Mutex<Vec<(String, String)>>>;

    // Minimal HTTP/1.1 responder: records "METHOD PATH" plus the
    // Authorization header, answers from `route`.
    async fn serve(listener: TcpListener, seen: Seen, route: fn(&str) -> (u16, String)) {
        loop {
            let Ok((socket, _)) = listener.accept().await else { return };
            let seen = seen.clone();
            tokio::spawn(async move {
                let _ = handle(socket, seen, route).await;
            });
        }
    }

    async fn handle(
        mut socket: TcpStream,
        seen: Seen,
        route: fn(&str) -> (u16, String),
    ) -> std::io::Result<()> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let (head_end, content_len) = loop {
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap_or(0)))
                    .unwrap_or(0);
                break (pos + 4, len);
            }
        };
        while buf.len() < head_end + content_len {
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let request_line = head.lines().next().unwrap_or("").to_string();
        let path = request_line.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
        let auth = head
            .lines()
            .find_map(|l| {
                let lower = l.to_ascii_lowercase();
                lower.starts_with("authorization:").then(|| l[14..].trim().to_string())
            })
            .unwrap_or_default();
        seen.lock().unwrap().push((path.clone(), auth));
        let (status, body) = route(&path);
        let resp = format!(
            "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        socket.write_all(resp.as_bytes()).await?;
        socket.shutdown().await?;
        Ok(())
    }

    fn notification(user: &str) -> Notification {
        Notification::for_tick(
            SubscriberId::new(user),
            &Tick {
                symbol: "AAPL".to_string(),
                price: 100.0,
                volume: 1.0,
                timestamp: 0,
            },
        )
    }

    async fn start(route: fn(&str) -> (u16, String)) -> (String, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(serve(listener, seen.clone(), route));
        (format!("http://{}/api/v10", addr), seen)
    }

    #[tokio::test]
    async fn opens_dm_once_then_posts_messages() {
        let (base, seen) = start(|path| match path {
            "POST /api/v10/users/@me/channels" => (200, r#"{"id":"555","type":1}"#.to_string()),
            "POST /api/v10/channels/555/messages" => (200, r#"{"id":"1"}"#.to_string()),
            _ => (404, "{}".to_string()),
        })
        .await;
        let notifier = DiscordNotifier::new(&base, "secret").unwrap();
        notifier.notify(&notification("42")).await.unwrap();
        notifier.notify(&notification("42")).await.unwrap();

        let seen = seen.lock().unwrap().clone();
        let paths: Vec<&str> = seen.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "POST /api/v10/users/@me/channels",
                "POST /api/v10/channels/555/messages",
                "POST /api/v10/channels/555/messages",
            ]
        );
        assert!(seen.iter().all(|(_, auth)| auth == "Bot secret"));
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let (base, _seen) = start(|path| match path {
            "POST /api/v10/users/@me/channels" => (200, r#"{"id":"9"}"#.to_string()),
            _ => (403, r#"{"message":"Cannot send messages to this user"}"#.to_string()),
        })
        .await;
        let notifier = DiscordNotifier::new(&base, "secret").unwrap();
        match notifier.notify(&notification("1")).await {
            Err(NotifyError::Rejected { status, body }) => {
                assert_eq!(status, 403);
                assert!(body.contains("Cannot send"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }
}
