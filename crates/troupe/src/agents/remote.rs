//! Client side of the agent-to-agent protocol: streams a task to a remote
//! agent's endpoint and relays its canonical stream events.

use std::time::Duration;

use async_stream::try_stream;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::providers::base::{ProviderStream, StreamEvent};

#[derive(Debug, Serialize)]
struct TaskEnvelope<'a> {
    task: &'a str,
    relevant_messages: &'a [Message],
}

pub struct RemoteAgentClient {
    client: Client,
    endpoint: String,
}

impl RemoteAgentClient {
    pub fn new(endpoint: String) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self { client, endpoint })
    }

    /// POST the task envelope and decode the response body as one JSON
    /// stream event per line.
    pub fn stream(&self, task: &str, relevant_messages: &[Message]) -> ProviderStream {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let body = serde_json::to_value(TaskEnvelope {
            task,
            relevant_messages,
        })
        .unwrap_or_default();

        Box::pin(try_stream! {
            let response = client.post(&endpoint).json(&body).send().await?;
            let status = response.status();
            if status != StatusCode::OK {
                let text = response.text().await.unwrap_or_default();
                Err::<(), ProviderError>(ProviderError::Request(format!("remote agent {status}: {text}")))?;
                return;
            }

            let mut buffer = String::new();
            let mut bytes = response.bytes_stream();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..newline + 1).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<StreamEvent>(line) {
                        Ok(event) => yield event,
                        Err(e) => {
                            tracing::debug!("skipping undecodable remote event: {e}");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::base::StopReason;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_stream_decodes_json_lines() {
        let events = [
            StreamEvent::TextDelta {
                text: "remote says hi".to_string(),
            },
            StreamEvent::Stop {
                reason: StopReason::EndTurn,
            },
        ];
        let body: String = events
            .iter()
            .map(|e| format!("{}\n", serde_json::to_string(e).unwrap()))
            .collect();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/Coder"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = RemoteAgentClient::new(format!("{}/Coder", server.uri())).unwrap();
        let received: Vec<StreamEvent> = client
            .stream("fix it", &[])
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(received.len(), 2);
        assert_eq!(
            received[0],
            StreamEvent::TextDelta {
                text: "remote says hi".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_non_ok_status_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = RemoteAgentClient::new(server.uri()).unwrap();
        let mut stream = client.stream("task", &[]);
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(ProviderError::Request(_))
        ));
    }
}
