//! DNS handler behavior: answers, unknown-name policies, fall-through.

mod common;

use common::*;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;

use quay_dns::config::UnknownAction;
use quay_dns::handler::QueryHandler;
use quay_dns::store::RecordStore;
use std::sync::Arc;

// =========================================================================
// Known names
// =========================================================================

#[tokio::test]
async fn known_name_returns_single_authoritative_a_record() {
    let handler = test_handler(&[("app.example.com", "192.168.1.10")], UnknownAction::Drop);

    let capture = execute_query(&handler, "app.example.com.", RecordType::A, 1).await;
    let msg = capture.into_message();

    assert_response_code(&msg, ResponseCode::NoError);
    assert!(msg.authoritative(), "known-name answer must set AA");
    assert_eq!(msg.answers().len(), 1);
    assert_eq!(extract_a_ips(&msg), vec!["192.168.1.10"]);
    assert_eq!(msg.answers()[0].ttl(), 60);
}

#[tokio::test]
async fn configured_ttl_is_used() {
    let store = test_store(&[("app.example.com", "192.168.1.10")]);
    let mut config = test_dns_config(UnknownAction::Drop);
    config.ttl = 123;
    let handler = QueryHandler::new(store, &config);

    let capture = execute_query(&handler, "app.example.com.", RecordType::A, 2).await;
    let msg = capture.into_message();
    assert_eq!(msg.answers()[0].ttl(), 123);
}

#[tokio::test]
async fn query_name_matching_is_case_insensitive() {
    let handler = test_handler(&[("test.example", "10.0.0.1")], UnknownAction::NxDomain);

    let capture = execute_query(&handler, "TEST.EXAMPLE.", RecordType::A, 3).await;
    let msg = capture.into_message();

    assert_response_code(&msg, ResponseCode::NoError);
    assert_eq!(extract_a_ips(&msg), vec!["10.0.0.1"]);
}

// =========================================================================
// AAAA short-circuit
// =========================================================================

#[tokio::test]
async fn aaaa_for_known_name_returns_empty_authoritative_answer() {
    let handler = test_handler(&[("app.example.com", "192.168.1.10")], UnknownAction::Drop);

    let capture = execute_query(&handler, "app.example.com.", RecordType::AAAA, 4).await;
    let msg = capture.into_message();

    assert_response_code(&msg, ResponseCode::NoError);
    assert!(msg.authoritative());
    assert_eq!(msg.answers().len(), 0);
}

#[tokio::test]
async fn aaaa_for_unknown_name_follows_unknown_action() {
    let drop_handler = test_handler(&[], UnknownAction::Drop);
    let capture = execute_query(&drop_handler, "nowhere.example.com.", RecordType::AAAA, 5).await;
    assert!(!capture.response_sent());

    let nx_handler = test_handler(&[], UnknownAction::NxDomain);
    let capture = execute_query(&nx_handler, "nowhere.example.com.", RecordType::AAAA, 6).await;
    assert_response_code(&capture.into_message(), ResponseCode::NXDomain);
}

// =========================================================================
// Unknown-name policies
// =========================================================================

#[tokio::test]
async fn unknown_name_in_drop_mode_writes_no_response() {
    let handler = test_handler(&[("app.example.com", "192.168.1.10")], UnknownAction::Drop);

    let capture = execute_query(&handler, "nowhere.example.com.", RecordType::A, 7).await;
    assert!(
        !capture.response_sent(),
        "drop mode must not write any response"
    );
}

#[tokio::test]
async fn unknown_name_in_nxdomain_mode_answers_nxdomain() {
    let handler = test_handler(&[("app.example.com", "192.168.1.10")], UnknownAction::NxDomain);

    let capture = execute_query(&handler, "nowhere.example.com.", RecordType::A, 8).await;
    let msg = capture.into_message();

    assert_response_code(&msg, ResponseCode::NXDomain);
    assert_eq!(msg.answers().len(), 0);
}

// =========================================================================
// Invalid stored IPs
// =========================================================================

#[tokio::test]
async fn invalid_stored_ip_is_treated_as_miss() {
    let handler = test_handler(&[("bad.example.com", "not-an-ip")], UnknownAction::NxDomain);

    let capture = execute_query(&handler, "bad.example.com.", RecordType::A, 9).await;
    assert_response_code(&capture.into_message(), ResponseCode::NXDomain);
}

#[tokio::test]
async fn stored_ipv6_is_treated_as_miss_for_a_queries() {
    let handler = test_handler(&[("v6.example.com", "::1")], UnknownAction::Drop);

    let capture = execute_query(&handler, "v6.example.com.", RecordType::A, 10).await;
    assert!(!capture.response_sent());
}

// =========================================================================
// Other query types
// =========================================================================

#[tokio::test]
async fn other_query_types_without_next_answer_servfail() {
    let handler = test_handler(&[("app.example.com", "192.168.1.10")], UnknownAction::Drop);

    let capture = execute_query(&handler, "app.example.com.", RecordType::MX, 11).await;
    assert_response_code(&capture.into_message(), ResponseCode::ServFail);
}

/// Next handler answering NoError with no records, distinguishable from
/// the SERVFAIL the chain end would produce.
#[derive(Clone, Copy)]
struct NoErrorNext;

#[async_trait::async_trait]
impl hickory_server::server::RequestHandler for NoErrorNext {
    async fn handle_request<R: hickory_server::server::ResponseHandler>(
        &self,
        request: &hickory_server::server::Request,
        mut response_handle: R,
    ) -> hickory_server::server::ResponseInfo {
        let header = hickory_proto::op::Header::response_from_request(request.header());
        let response = hickory_server::authority::MessageResponseBuilder::from_message_request(
            request,
        )
        .build_no_records(header);
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(_) => header.into(),
        }
    }
}

#[tokio::test]
async fn other_query_types_with_next_are_delegated() {
    let handler = test_handler(&[("app.example.com", "192.168.1.10")], UnknownAction::Drop)
        .with_next(NoErrorNext);

    // MX is foreign to the first handler; the NoError answer proves the
    // query traveled down the chain instead of SERVFAILing here.
    let capture = execute_query(&handler, "app.example.com.", RecordType::MX, 12).await;
    let msg = capture.into_message();
    assert_response_code(&msg, ResponseCode::NoError);
    assert_eq!(msg.answers().len(), 0);
}

// =========================================================================
// Fall-through
// =========================================================================

#[tokio::test]
async fn fallthrough_delegates_unknown_names_to_next() {
    let next = test_handler(&[("miss.example.com", "10.9.9.9")], UnknownAction::NxDomain);

    let store = test_store(&[("app.example.com", "192.168.1.10")]);
    let config = test_dns_config(UnknownAction::Fallthrough);
    let handler = QueryHandler::new(store, &config).with_next(next);

    // Known locally: answered here, not delegated.
    let capture = execute_query(&handler, "app.example.com.", RecordType::A, 13).await;
    assert_eq!(extract_a_ips(&capture.into_message()), vec!["192.168.1.10"]);

    // Unknown locally: the next handler answers.
    let capture = execute_query(&handler, "miss.example.com.", RecordType::A, 14).await;
    assert_eq!(extract_a_ips(&capture.into_message()), vec!["10.9.9.9"]);
}

#[tokio::test]
async fn fallthrough_zone_list_scopes_delegation() {
    let next = test_handler(&[("a.fall.zone", "10.9.9.9")], UnknownAction::NxDomain);

    let store = Arc::new(RecordStore::new("node1"));
    let mut config = test_dns_config(UnknownAction::NxDomain);
    config.fallthrough_zones = Some(vec!["fall.zone".to_string()]);
    let handler = QueryHandler::new(store, &config).with_next(next);

    // Inside the fall-through zone: delegated and answered by next.
    let capture = execute_query(&handler, "a.fall.zone.", RecordType::A, 15).await;
    assert_eq!(extract_a_ips(&capture.into_message()), vec!["10.9.9.9"]);

    // Outside the zone: local unknown action applies.
    let capture = execute_query(&handler, "a.other.zone.", RecordType::A, 16).await;
    assert_response_code(&capture.into_message(), ResponseCode::NXDomain);
}

#[tokio::test]
async fn fallthrough_without_next_answers_servfail() {
    let handler = test_handler(&[], UnknownAction::Fallthrough);

    let capture = execute_query(&handler, "nowhere.example.com.", RecordType::A, 17).await;
    assert_response_code(&capture.into_message(), ResponseCode::ServFail);
}
