// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(dead_code)]
//! Scripted in-memory fetcher shared by the integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{stream, FutureExt, StreamExt};
use replay_net::{FetchError, FetchRequest, FetchResponse, Fetcher};

pub const MULTIPART: &str = r#"multipart/mixed; boundary="-"; deferSpec=20220824"#;

/// One canned response.
#[derive(Debug, Clone)]
pub struct Scripted {
    pub status: u16,
    pub content_type: Option<String>,
    pub chunks: Vec<Vec<u8>>,
    /// Keep the body open after the last chunk.
    pub hang: bool,
}

impl Scripted {
    pub fn json(body: &str) -> Self {
        Self {
            status: 200,
            content_type: Some("application/json".into()),
            chunks: vec![body.as_bytes().to_vec()],
            hang: false,
        }
    }

    pub fn multipart(body: &str, chunk_size: usize) -> Self {
        Self {
            status: 200,
            content_type: Some(MULTIPART.into()),
            chunks: body
                .as_bytes()
                .chunks(chunk_size)
                .map(<[u8]>::to_vec)
                .collect(),
            hang: false,
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: Some("text/plain".into()),
            chunks: vec![body.as_bytes().to_vec()],
            hang: false,
        }
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }
}

/// Serves scripted responses in order and records every request.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<FetchRequest>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, FetchError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        async move {
            let scripted =
                next.ok_or_else(|| FetchError::Transport("no scripted response left".into()))?;
            let chunks = stream::iter(
                scripted
                    .chunks
                    .into_iter()
                    .map(|c| Ok::<_, FetchError>(Bytes::from(c))),
            );
            let body = if scripted.hang {
                chunks.chain(stream::pending()).boxed()
            } else {
                chunks.boxed()
            };
            Ok(FetchResponse {
                status: scripted.status,
                content_type: scripted.content_type,
                body,
            })
        }
        .boxed()
    }
}

/// Frame `parts` as a multipart body with boundary `-`.
pub fn multipart_body(parts: &[serde_json::Value]) -> String {
    let mut body = String::new();
    for part in parts {
        body.push_str("\r\n---\r\nContent-Type: application/json; charset=utf-8\r\n\r\n");
        body.push_str(&part.to_string());
    }
    body.push_str("\r\n-----\r\n");
    body
}
