//! DNS request handling.
//!
//! Implemented as a [`RequestHandler`] rather than a zone authority because
//! the `drop` policy for unknown names must be able to return without
//! writing any response at all: the client times out while a parallel
//! split-DNS resolver answers. Known names get authoritative A answers;
//! AAAA queries for known names get an authoritative empty answer so
//! dual-stack clients stop waiting for the pair.

use async_trait::async_trait;
use hickory_proto::op::{Header, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::config::{DnsConfig, UnknownAction};
use crate::metrics::{self, QueryResult, Timer};
use crate::store::RecordStore;

/// Zone-scoped fall-through predicate.
///
/// Disabled by default; enabled with an empty zone list it matches every
/// name, otherwise only names equal to or under one of the zones.
#[derive(Debug, Clone, Default)]
pub struct Fallthrough {
    enabled: bool,
    zones: Vec<String>,
}

impl Fallthrough {
    /// Fall-through disabled.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Fall through for every zone.
    pub fn all() -> Self {
        Self {
            enabled: true,
            zones: Vec::new(),
        }
    }

    /// Fall through only for names under the given zones.
    pub fn zones<I: IntoIterator<Item = S>, S: AsRef<str>>(zones: I) -> Self {
        Self {
            enabled: true,
            zones: zones
                .into_iter()
                .map(|z| z.as_ref().trim_end_matches('.').to_lowercase())
                .collect(),
        }
    }

    /// True when `qname` (lowercase, no trailing dot) should be delegated.
    pub fn matches(&self, qname: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if self.zones.is_empty() {
            return true;
        }
        self.zones
            .iter()
            .any(|zone| qname == zone || qname.ends_with(&format!(".{zone}")))
    }
}

/// Terminal chain element: answers SERVFAIL for anything it receives.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unhandled;

#[async_trait]
impl RequestHandler for Unhandled {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let mut header = Header::response_from_request(request.header());
        header.set_response_code(ResponseCode::ServFail);
        let response =
            MessageResponseBuilder::from_message_request(request).build_no_records(header);
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(_) => header.into(),
        }
    }
}

/// Handler answering A/AAAA queries from the record store.
///
/// Generic over the next handler in the chain; unknown names are delegated
/// to it when fall-through matches, or when any other query type arrives.
#[derive(Clone)]
pub struct QueryHandler<N = Unhandled> {
    store: Arc<RecordStore>,
    ttl: u32,
    unknown_action: UnknownAction,
    fallthrough: Fallthrough,
    next: Option<N>,
}

impl QueryHandler<Unhandled> {
    /// Build a handler from configuration, without a next handler.
    pub fn new(store: Arc<RecordStore>, config: &DnsConfig) -> Self {
        // `unknown_action = fallthrough` is sugar for a match-all zone list.
        let (unknown_action, fallthrough) =
            match (config.unknown_action, config.fallthrough_zones.as_deref()) {
                (UnknownAction::Fallthrough, _) => (UnknownAction::Drop, Fallthrough::all()),
                (action, Some(zones)) => (action, Fallthrough::zones(zones)),
                (action, None) => (action, Fallthrough::disabled()),
            };

        Self {
            store,
            ttl: config.ttl,
            unknown_action,
            fallthrough,
            next: None,
        }
    }
}

impl<N> QueryHandler<N> {
    /// Chain a next handler for fall-through and foreign query types.
    pub fn with_next<M>(self, next: M) -> QueryHandler<M> {
        QueryHandler {
            store: self.store,
            ttl: self.ttl,
            unknown_action: self.unknown_action,
            fallthrough: self.fallthrough,
            next: Some(next),
        }
    }
}

impl<N: RequestHandler> QueryHandler<N> {
    /// Send a prepared response, degrading to SERVFAIL bookkeeping if the
    /// socket write fails.
    async fn respond<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: &mut R,
        header: Header,
        answers: &[Record],
    ) -> ResponseInfo {
        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(
            header,
            answers.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!("failed to write DNS response: {e}");
                let mut failed = header;
                failed.set_response_code(ResponseCode::ServFail);
                failed.into()
            }
        }
    }

    /// Apply the unknown-name policy.
    async fn handle_unknown<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
        qname: &str,
        rtype: &str,
        timer: Timer,
    ) -> ResponseInfo {
        if self.fallthrough.matches(qname) {
            if let Some(next) = &self.next {
                metrics::record_query(rtype, QueryResult::Fallthrough, timer.elapsed());
                return next.handle_request(request, response_handle).await;
            }
            // Fall-through configured but nothing to fall through to.
            metrics::record_query(rtype, QueryResult::ServFail, timer.elapsed());
            let mut header = Header::response_from_request(request.header());
            header.set_response_code(ResponseCode::ServFail);
            return self.respond(request, &mut response_handle, header, &[]).await;
        }

        match self.unknown_action {
            UnknownAction::NxDomain => {
                metrics::record_query(rtype, QueryResult::NxDomain, timer.elapsed());
                let mut header = Header::response_from_request(request.header());
                header.set_response_code(ResponseCode::NXDomain);
                self.respond(request, &mut response_handle, header, &[]).await
            }
            UnknownAction::Drop | UnknownAction::Fallthrough => {
                // Success with no written message: the client times out and
                // a parallel resolver gets to answer.
                debug!(name = %qname, "no record found, dropping query");
                metrics::record_query(rtype, QueryResult::Dropped, timer.elapsed());
                Header::response_from_request(request.header()).into()
            }
        }
    }
}

#[async_trait]
impl<N: RequestHandler> RequestHandler for QueryHandler<N> {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let timer = Timer::start();
        let Ok(request_info) = request.request_info() else {
            metrics::record_query("UNKNOWN", QueryResult::ServFail, timer.elapsed());
            let mut header = Header::response_from_request(request.header());
            header.set_response_code(ResponseCode::ServFail);
            return self.respond(request, &mut response_handle, header, &[]).await;
        };
        let query = request_info.query;
        let qtype = query.query_type();
        let rtype = format!("{qtype:?}");

        // Normalize: lowercase, no trailing dot.
        let qname = query
            .name()
            .to_string()
            .trim_end_matches('.')
            .to_lowercase();

        if qtype != RecordType::A && qtype != RecordType::AAAA {
            if let Some(next) = &self.next {
                metrics::record_query(&rtype, QueryResult::Fallthrough, timer.elapsed());
                return next.handle_request(request, response_handle).await;
            }
            metrics::record_query(&rtype, QueryResult::ServFail, timer.elapsed());
            let mut header = Header::response_from_request(request.header());
            header.set_response_code(ResponseCode::ServFail);
            return self.respond(request, &mut response_handle, header, &[]).await;
        }

        let Some(ip) = self.store.lookup(&qname) else {
            return self
                .handle_unknown(request, response_handle, &qname, &rtype, timer)
                .await;
        };

        if qtype == RecordType::AAAA {
            // Known name, no IPv6: an authoritative empty answer stops
            // dual-stack clients from waiting out the A/AAAA pair.
            metrics::record_query(&rtype, QueryResult::Hit, timer.elapsed());
            let mut header = Header::response_from_request(request.header());
            header.set_authoritative(true);
            return self.respond(request, &mut response_handle, header, &[]).await;
        }

        let addr = match ip.parse::<Ipv4Addr>() {
            Ok(addr) => addr,
            Err(_) => {
                warn!(name = %qname, ip = %ip, "stored IP is not IPv4, treating as miss");
                return self
                    .handle_unknown(request, response_handle, &qname, &rtype, timer)
                    .await;
            }
        };

        metrics::record_query(&rtype, QueryResult::Hit, timer.elapsed());
        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);
        let name = Name::from(query.name().clone());
        let answers = [Record::from_rdata(name, self.ttl, RData::A(A(addr)))];
        self.respond(request, &mut response_handle, header, &answers)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallthrough_disabled_matches_nothing() {
        let fall = Fallthrough::disabled();
        assert!(!fall.matches("a.example.com"));
    }

    #[test]
    fn test_fallthrough_all_matches_everything() {
        let fall = Fallthrough::all();
        assert!(fall.matches("a.example.com"));
        assert!(fall.matches("anything"));
    }

    #[test]
    fn test_fallthrough_zone_scoping() {
        let fall = Fallthrough::zones(["Example.ORG."]);
        assert!(fall.matches("example.org"));
        assert!(fall.matches("deep.sub.example.org"));
        assert!(!fall.matches("example.com"));
        assert!(!fall.matches("notexample.org"));
    }
}
