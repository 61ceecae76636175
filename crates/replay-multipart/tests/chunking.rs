// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(clippy::unwrap_used)]
//! Chunking invariance: however a body is split, the same parts come out.

use proptest::prelude::*;
use replay_multipart::PatchResolver;
use serde_json::{json, Value};

fn body(boundary: &str, parts: &[Value], preamble: &str) -> String {
    let mut out = String::from(preamble);
    for part in parts {
        let text = part.to_string();
        out.push_str(&format!(
            "\r\n--{boundary}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\n\r\n{text}",
            text.len()
        ));
    }
    out.push_str(&format!("\r\n--{boundary}--\r\n"));
    out
}

fn incremental_parts() -> Vec<Value> {
    vec![
        json!({"data": {"posts": []}, "hasNext": true, "pending": [{"id": "0", "path": ["posts"]}]}),
        json!({"hasNext": true, "incremental": [{"id": "0", "items": [{"id": "1", "title": "héllo ✓"}]}]}),
        json!({"hasNext": false, "incremental": [{"id": "0", "items": [{"id": "2"}]}], "completed": [{"id": "0"}]}),
    ]
}

fn feed(resolver: &mut PatchResolver, bytes: &[u8], sizes: &[usize]) -> Vec<Value> {
    let mut out = Vec::new();
    let mut rest = bytes;
    let mut sizes = sizes.iter().cycle();
    while !rest.is_empty() {
        let n = (*sizes.next().unwrap()).clamp(1, rest.len());
        out.extend(resolver.handle_chunk(&rest[..n]).unwrap());
        rest = &rest[n..];
    }
    out
}

#[test]
fn one_byte_at_a_time_matches_single_chunk() {
    let parts = incremental_parts();
    let text = body("-", &parts, "");

    let mut whole: PatchResolver = PatchResolver::new("-");
    let all_at_once = whole.handle_chunk(&text).unwrap();

    let mut bytewise: PatchResolver = PatchResolver::new("-");
    let one_by_one = feed(&mut bytewise, text.as_bytes(), &[1]);

    assert_eq!(all_at_once, parts);
    assert_eq!(one_by_one, parts);
    assert!(whole.is_closed());
    assert!(bytewise.is_closed());
}

#[test]
fn single_chunk_can_complete_many_parts() {
    let parts = incremental_parts();
    let text = body("graphql", &parts, "");
    let mut resolver: PatchResolver = PatchResolver::new("graphql");
    let got = resolver.handle_chunk(text.as_bytes()).unwrap();
    assert_eq!(got.len(), 3);
}

#[test]
fn typed_parts_deserialize_directly() {
    #[derive(serde::Deserialize, Debug, PartialEq)]
    struct Part {
        #[serde(rename = "hasNext")]
        has_next: bool,
    }
    let text = body("-", &incremental_parts(), "");
    let mut resolver: PatchResolver<Part> = PatchResolver::new("-");
    let got = resolver.handle_chunk(text).unwrap();
    assert_eq!(
        got,
        vec![
            Part { has_next: true },
            Part { has_next: true },
            Part { has_next: false }
        ]
    );
}

proptest! {
    #[test]
    fn arbitrary_chunking_yields_same_parts(
        sizes in prop::collection::vec(1usize..40, 1..32),
        preamble in "[a-z ]{0,24}",
    ) {
        let parts = incremental_parts();
        let text = body("-", &parts, &preamble);
        let mut resolver: PatchResolver = PatchResolver::new("-");
        let got = feed(&mut resolver, text.as_bytes(), &sizes);
        prop_assert_eq!(got, parts);
        prop_assert!(resolver.is_closed());
    }
}
