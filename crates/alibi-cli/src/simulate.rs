//! Command-line clients for a running gateway: a scripted agent and a
//! one-shot participant

use std::time::Duration;

use alibi_core::{InboundEvent, OutboundEvent};
use alibi_gateway::protocol;
use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub fn simulated_reply(suspect_id: &str, message: &str) -> String {
    format!("Simulated {} reply to: {}", suspect_id, message)
}

fn frame(event: &InboundEvent) -> Result<WsMessage> {
    let json = protocol::encode_inbound(event).context("Failed to encode frame")?;
    Ok(WsMessage::Text(json.into()))
}

/// Register as `suspect_id` and answer every forwarded message after `delay`
/// until cancelled or the server goes away.
pub async fn run_agent(
    url: &str,
    suspect_id: &str,
    delay: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    let (mut ws_write, mut ws_read) = ws.split();

    ws_write
        .send(frame(&InboundEvent::RegisterAgent {
            suspect_id: suspect_id.to_string(),
        })?)
        .await?;
    info!("Agent registered for {} at {}", suspect_id, url);

    // Delayed replies come back through here so reading never stalls
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<InboundEvent>();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_write
                    .send(frame(&InboundEvent::UnregisterAgent {
                        suspect_id: suspect_id.to_string(),
                    })?)
                    .await;
                let _ = ws_write.close().await;
                info!("Agent for {} stopped", suspect_id);
                return Ok(());
            }
            Some(reply) = reply_rx.recv() => {
                ws_write.send(frame(&reply)?).await?;
            }
            msg = ws_read.next() => {
                let text = match msg {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => {
                        warn!("Server closed the connection");
                        return Ok(());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => bail!("WebSocket error: {}", e),
                };

                let Some(OutboundEvent::ParticipantMessage {
                    request_id,
                    participant_id,
                    suspect_id: target,
                    message,
                }) = protocol::decode_outbound(text.as_str())
                else {
                    continue;
                };
                if target != suspect_id {
                    debug!("Ignoring message for {}", target);
                    continue;
                }

                info!("{} asks {}: {}", participant_id, target, message);
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = reply_tx.send(InboundEvent::AgentReply {
                        message: simulated_reply(&target, &message),
                        suspect_id: target,
                        participant_id,
                        request_id: Some(request_id),
                    });
                });
            }
        }
    }
}

/// Send one message and wait for the suspect's answer
pub async fn chat_once(
    url: &str,
    participant_id: &str,
    suspect_id: &str,
    message: &str,
    timeout: Duration,
) -> Result<String> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;

    ws.send(frame(&InboundEvent::ChatMessage {
        participant_id: participant_id.to_string(),
        suspect_id: suspect_id.to_string(),
        message: message.to_string(),
    })?)
    .await?;

    let reply = tokio::time::timeout(timeout, next_response(&mut ws, suspect_id))
        .await
        .with_context(|| format!("No reply from {} within {:?}", suspect_id, timeout))??;
    let _ = ws.close(None).await;
    Ok(reply)
}

async fn next_response<S>(ws: &mut S, suspect_id: &str) -> Result<String>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    while let Some(msg) = ws.next().await {
        let text = match msg? {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        if let Some(OutboundEvent::ChatResponse {
            suspect_id: from,
            message,
            ..
        }) = protocol::decode_outbound(text.as_str())
        {
            if from == suspect_id {
                return Ok(message);
            }
        }
    }
    bail!("Connection closed before {} answered", suspect_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alibi_core::{MessageRouter, RouterConfig, ScriptedResponder};
    use alibi_gateway::GatewayServer;
    use alibi_store::{ConversationStore, MemoryConversationStore};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[test]
    fn test_simulated_reply_text() {
        assert_eq!(
            simulated_reply("suspectA", "Where were you?"),
            "Simulated suspectA reply to: Where were you?"
        );
    }

    async fn start_stack(store: MemoryConversationStore) -> (String, alibi_core::RouterHandle, CancellationToken) {
        let cancel = CancellationToken::new();
        let store: Arc<dyn ConversationStore> = Arc::new(store);
        let (router, handle) = MessageRouter::new(
            RouterConfig {
                agent_timeout: Some(Duration::from_secs(5)),
                event_buffer: 32,
            },
            store.clone(),
            Arc::new(ScriptedResponder::new(["No comment."])),
        );
        tokio::spawn(router.run(cancel.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = GatewayServer::new(addr, handle.clone(), store, Vec::new(), cancel.clone());
        tokio::spawn(server.run_with_listener(listener));
        (format!("ws://{}/ws", addr), handle, cancel)
    }

    #[tokio::test]
    async fn test_chat_without_agent_gets_fallback() {
        let (url, _handle, cancel) = start_stack(MemoryConversationStore::new()).await;
        let reply = chat_once(&url, "p1", "suspectB", "Hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, "No comment.");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_simulated_agent_answers_chat() {
        let store = MemoryConversationStore::new();
        let (url, handle, cancel) = start_stack(store.clone()).await;

        let agent_cancel = CancellationToken::new();
        let agent_stop = agent_cancel.clone();
        let agent_url = url.clone();
        let agent = tokio::spawn(async move {
            run_agent(&agent_url, "suspectA", Duration::from_millis(10), agent_cancel).await
        });

        for _ in 0..200 {
            if !handle.status().await.unwrap().agents.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let reply = chat_once(&url, "p1", "suspectA", "Where were you?", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, "Simulated suspectA reply to: Where were you?");

        let conv = store.read("p1", "suspectA").await.unwrap();
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages[1].sender, "suspectA");

        agent_stop.cancel();
        agent.await.unwrap().unwrap();
        cancel.cancel();
    }
}
