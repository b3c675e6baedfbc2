//! JSON bulk lease-query protocol spoken over the TCP listener.
//!
//! Each request frame holds one JSON object tagged by `"query"`:
//!
//! ```text
//! {"query": "by-relay-id", "relay-id": "0x6464646464646464", "link": "2001:db8::/64", "page-size": 10}
//! {"query": "by-remote-id", "remote-id": "010203040506", "start-from": "2001:db8::3"}
//! {"query": "by-link", "link": "2001:db8::/64"}
//! {"query": "done"}
//! ```
//!
//! Answers are `{"result": 0, "leases": [...], "next": "<last address>"}` on
//! success and `{"result": 1, "text": "<reason>"}` for malformed requests.
//! A page whose reply would not fit in one frame is cut short; the client
//! continues from `next`.
//! `done` answers `good bye` and closes the connection.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::extended_info::parse_identifier;
use crate::lease::{Lease, LeasePage, LeasePageSize, Leases, Link};
use crate::tcp::{ConnectionId, MAX_FRAME_LEN, RequestHandler, Response};

/// Page size used when a request does not carry one.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Larger requested page sizes are clamped to this.
pub const MAX_PAGE_SIZE: usize = 1000;

pub const RESULT_SUCCESS: u8 = 0;
pub const RESULT_ERROR: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(
    tag = "query",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case"
)]
pub enum BulkQuery {
    ByRelayId {
        relay_id: String,
        link: Option<String>,
        start_from: Option<IpAddr>,
        page_size: Option<usize>,
    },
    ByRemoteId {
        remote_id: String,
        link: Option<String>,
        start_from: Option<IpAddr>,
        page_size: Option<usize>,
    },
    ByLink {
        link: String,
        start_from: Option<IpAddr>,
        page_size: Option<usize>,
    },
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryReply {
    pub result: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leases: Option<Vec<Lease>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<IpAddr>,
}

impl QueryReply {
    fn leases(leases: Vec<Lease>) -> Self {
        let next = leases.last().map(|lease| lease.address);
        Self {
            result: RESULT_SUCCESS,
            text: None,
            leases: Some(leases),
            next,
        }
    }

    fn text(result: u8, text: impl Into<String>) -> Self {
        Self {
            result,
            text: Some(text.into()),
            leases: None,
            next: None,
        }
    }

    fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| br#"{"result":1}"#.to_vec())
    }
}

/// Encodes a page of leases, dropping leases from the tail until the reply
/// fits in one frame.
fn page_payload(leases: Vec<Lease>) -> Vec<u8> {
    let mut leases = leases;
    loop {
        let reply = QueryReply::leases(leases);
        let payload = reply.to_payload();
        if payload.len() <= MAX_FRAME_LEN {
            return payload;
        }

        leases = reply.leases.unwrap_or_default();
        if leases.len() <= 1 {
            return QueryReply::text(
                RESULT_ERROR,
                format!(
                    "reply of {} bytes exceeds the {} byte frame limit",
                    payload.len(),
                    MAX_FRAME_LEN
                ),
            )
            .to_payload();
        }
        let keep = (leases.len() * MAX_FRAME_LEN / payload.len()).clamp(1, leases.len() - 1);
        debug!("Reply of {} lease(s) too large, trimming to {}", leases.len(), keep);
        leases.truncate(keep);
    }
}

fn parse_page(start_from: Option<IpAddr>, page_size: Option<usize>) -> Result<LeasePage> {
    Ok(LeasePage {
        start_from,
        size: LeasePageSize::new(page_size.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE))?,
    })
}

fn parse_link(link: Option<&str>) -> Result<Option<Link>> {
    link.map(str::parse).transpose()
}

fn parse_hex(field: &str, value: &str) -> Result<Vec<u8>> {
    parse_identifier(value)
        .ok_or_else(|| Error::InvalidParameter(format!("{} is not a hex string: {}", field, value)))
}

/// Answers bulk lease queries from a [`Leases`] store.
pub struct LeaseQueryHandler {
    leases: Arc<Leases>,
}

impl LeaseQueryHandler {
    pub fn new(leases: Arc<Leases>) -> Self {
        Self { leases }
    }

    async fn answer(&self, query: BulkQuery) -> Result<Vec<Lease>> {
        let leases = match query {
            BulkQuery::ByRelayId {
                relay_id,
                link,
                start_from,
                page_size,
            } => {
                let relay_id = parse_hex("relay-id", &relay_id)?;
                let link = parse_link(link.as_deref())?;
                let page = parse_page(start_from, page_size)?;
                self.leases
                    .get_leases_by_relay_id(&relay_id, link.as_ref(), &page)
                    .await
            }
            BulkQuery::ByRemoteId {
                remote_id,
                link,
                start_from,
                page_size,
            } => {
                let remote_id = parse_hex("remote-id", &remote_id)?;
                let link = parse_link(link.as_deref())?;
                let page = parse_page(start_from, page_size)?;
                self.leases
                    .get_leases_by_remote_id(&remote_id, link.as_ref(), &page)
                    .await
            }
            BulkQuery::ByLink {
                link,
                start_from,
                page_size,
            } => {
                let link: Link = link.parse()?;
                let page = parse_page(start_from, page_size)?;
                self.leases.get_leases_by_link(&link, &page).await
            }
            BulkQuery::Done => Vec::new(),
        };
        Ok(leases)
    }
}

#[async_trait]
impl RequestHandler for LeaseQueryHandler {
    async fn handle(&self, connection_id: ConnectionId, request: &[u8]) -> Response {
        let query: BulkQuery = match serde_json::from_slice(request) {
            Ok(query) => query,
            Err(error) => {
                debug!("Connection {} sent a malformed query: {}", connection_id, error);
                return Response::reply(
                    QueryReply::text(RESULT_ERROR, format!("malformed query: {}", error))
                        .to_payload(),
                );
            }
        };

        if query == BulkQuery::Done {
            return Response::terminate(QueryReply::text(RESULT_SUCCESS, "good bye").to_payload());
        }

        match self.answer(query).await {
            Ok(leases) => {
                debug!(
                    "Connection {} query returned {} lease(s)",
                    connection_id,
                    leases.len()
                );
                Response::reply(page_payload(leases))
            }
            Err(error) => {
                Response::reply(QueryReply::text(RESULT_ERROR, error.to_string()).to_payload())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeaseDatabaseConfig;
    use crate::lease::LeaseType;
    use serde_json::json;

    async fn handler() -> LeaseQueryHandler {
        let leases = Leases::new(LeaseDatabaseConfig::in_memory(true))
            .await
            .unwrap();
        for index in 1..=5u16 {
            let address = std::net::Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, index);
            let mut lease = Lease::new_v6(LeaseType::Na, address, vec![index as u8], 1000, 2000, 1);
            let relay_id = if index % 2 == 1 { "0x6464646464646464" } else { "6565656565656565" };
            lease.user_context = Some(json!({
                "ISC": { "relay-info": [{ "relay-id": relay_id, "remote-id": "010203040506" }] }
            }));
            leases.add_lease(&mut lease).await.unwrap();
        }
        let mut outside = Lease::new_v6(
            LeaseType::Na,
            "2001:db8:1::1".parse().unwrap(),
            vec![9],
            1000,
            2000,
            2,
        );
        leases.add_lease(&mut outside).await.unwrap();
        LeaseQueryHandler::new(Arc::new(leases))
    }

    async fn ask(handler: &LeaseQueryHandler, request: serde_json::Value) -> (QueryReply, bool) {
        let response = handler
            .handle(1, request.to_string().as_bytes())
            .await;
        let reply: QueryReply = serde_json::from_slice(&response.payload).unwrap();
        (reply, response.terminate)
    }

    fn addresses(reply: &QueryReply) -> Vec<String> {
        reply
            .leases
            .as_ref()
            .unwrap()
            .iter()
            .map(|lease| lease.address.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_query_by_relay_id_pages() {
        let handler = handler().await;
        let (reply, terminate) = ask(
            &handler,
            json!({ "query": "by-relay-id", "relay-id": "6464646464646464", "page-size": 2 }),
        )
        .await;
        assert!(!terminate);
        assert_eq!(reply.result, RESULT_SUCCESS);
        assert_eq!(addresses(&reply), vec!["2001:db8::1", "2001:db8::3"]);
        assert_eq!(reply.next, Some("2001:db8::3".parse().unwrap()));

        let (reply, _) = ask(
            &handler,
            json!({
                "query": "by-relay-id",
                "relay-id": "6464646464646464",
                "start-from": "2001:db8::3",
                "page-size": 2
            }),
        )
        .await;
        assert_eq!(addresses(&reply), vec!["2001:db8::5"]);

        let (reply, _) = ask(
            &handler,
            json!({
                "query": "by-relay-id",
                "relay-id": "6464646464646464",
                "start-from": "2001:db8::5"
            }),
        )
        .await;
        assert_eq!(reply.result, RESULT_SUCCESS);
        assert!(addresses(&reply).is_empty());
        assert_eq!(reply.next, None);
    }

    #[tokio::test]
    async fn test_query_by_remote_id_with_link() {
        let handler = handler().await;
        let (reply, _) = ask(
            &handler,
            json!({ "query": "by-remote-id", "remote-id": "010203040506", "link": "2001:db8::/64" }),
        )
        .await;
        assert_eq!(addresses(&reply).len(), 5);

        let (reply, _) = ask(
            &handler,
            json!({ "query": "by-remote-id", "remote-id": "010203040506", "link": "2001:db8:2::/64" }),
        )
        .await;
        assert!(addresses(&reply).is_empty());
    }

    #[tokio::test]
    async fn test_query_by_link() {
        let handler = handler().await;
        let (reply, _) = ask(&handler, json!({ "query": "by-link", "link": "2001:db8:1::/48" })).await;
        assert_eq!(addresses(&reply), vec!["2001:db8:1::1"]);

        let (reply, _) = ask(
            &handler,
            json!({ "query": "by-link", "link": "2001:db8::/32", "page-size": 10 }),
        )
        .await;
        assert_eq!(addresses(&reply).len(), 6);
    }

    #[tokio::test]
    async fn test_malformed_queries_keep_connection() {
        let handler = handler().await;
        let requests = [
            json!({ "query": "by-relay-id", "relay-id": "zz" }),
            json!({ "query": "by-relay-id", "relay-id": "6464", "page-size": 0 }),
            json!({ "query": "by-relay-id", "relay-id": "6464", "link": "2001:db8::/129" }),
            json!({ "query": "by-link" }),
            json!({ "query": "by-vendor" }),
            json!({ "relay-id": "6464" }),
            json!({ "query": "by-link", "link": "2001:db8::/64", "start-from": "nowhere" }),
        ];
        for request in requests {
            let (reply, terminate) = ask(&handler, request.clone()).await;
            assert_eq!(reply.result, RESULT_ERROR, "{request}");
            assert!(reply.text.is_some());
            assert!(!terminate);
        }

        let response = handler.handle(1, b"not json").await;
        assert!(!response.terminate);
    }

    async fn bulky_handler(count: u16) -> LeaseQueryHandler {
        let leases = Leases::new(LeaseDatabaseConfig::in_memory(true))
            .await
            .unwrap();
        for index in 0..count {
            let address = std::net::Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 1, index);
            let mut lease = Lease::new_v6(LeaseType::Na, address, vec![0xab; 32], 1000, 2000, 1);
            lease.hostname = Some(format!("{}.{}", index, "host".repeat(32)));
            lease.user_context = Some(json!({
                "ISC": { "relay-info": [{ "relay-id": "6464646464646464" }] }
            }));
            leases.add_lease(&mut lease).await.unwrap();
        }
        LeaseQueryHandler::new(Arc::new(leases))
    }

    #[tokio::test]
    async fn test_large_page_is_trimmed_to_one_frame() {
        let handler = bulky_handler(400).await;
        let mut collected = Vec::new();
        let mut start_from: Option<String> = None;

        for _ in 0..400 {
            let mut request = json!({ "query": "by-link", "link": "2001:db8::/64", "page-size": 400 });
            if let Some(cursor) = &start_from {
                request["start-from"] = json!(cursor);
            }
            let response = handler.handle(1, request.to_string().as_bytes()).await;
            assert!(response.payload.len() <= MAX_FRAME_LEN);

            let reply: QueryReply = serde_json::from_slice(&response.payload).unwrap();
            assert_eq!(reply.result, RESULT_SUCCESS);
            let page = addresses(&reply);
            if page.is_empty() {
                break;
            }
            assert_eq!(reply.next.map(|next| next.to_string()).as_ref(), page.last());
            start_from = page.last().cloned();
            collected.extend(page);
        }

        assert_eq!(collected.len(), 400);
        let expected: Vec<String> = (0..400u16)
            .map(|index| std::net::Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 1, index).to_string())
            .collect();
        assert_eq!(collected, expected);
    }

    #[tokio::test]
    async fn test_first_page_of_large_query_is_partial() {
        let handler = bulky_handler(400).await;
        let (reply, terminate) = ask(
            &handler,
            json!({ "query": "by-relay-id", "relay-id": "6464646464646464", "page-size": 400 }),
        )
        .await;
        assert!(!terminate);
        assert_eq!(reply.result, RESULT_SUCCESS);
        let page = addresses(&reply);
        assert!(!page.is_empty() && page.len() < 400);
    }

    #[tokio::test]
    async fn test_lease_too_large_for_a_frame() {
        let leases = Leases::new(LeaseDatabaseConfig::in_memory(true))
            .await
            .unwrap();
        let mut lease = Lease::new_v6(
            LeaseType::Na,
            "2001:db8::1".parse().unwrap(),
            vec![1],
            1000,
            2000,
            1,
        );
        lease.user_context = Some(json!({ "blob": "z".repeat(MAX_FRAME_LEN) }));
        leases.add_lease(&mut lease).await.unwrap();
        let handler = LeaseQueryHandler::new(Arc::new(leases));

        let (reply, terminate) =
            ask(&handler, json!({ "query": "by-link", "link": "2001:db8::/64" })).await;
        assert!(!terminate);
        assert_eq!(reply.result, RESULT_ERROR);
        assert!(reply.text.unwrap().contains("frame limit"));
    }

    #[tokio::test]
    async fn test_done_terminates() {
        let handler = handler().await;
        let (reply, terminate) = ask(&handler, json!({ "query": "done" })).await;
        assert!(terminate);
        assert_eq!(reply.result, RESULT_SUCCESS);
        assert_eq!(reply.text.as_deref(), Some("good bye"));
    }
}
