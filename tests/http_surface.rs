// Router-level behaviour: routing, error bodies, stale markers and status endpoints
mod common;

#[cfg(test)]
mod test {
    use std::time::Duration;

    use axum::{body::Body, http::Request};
    use hospital_gateway::config::CircuitBreakerConfig;
    use hyper::{StatusCode, header};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::common::{Harness, ScriptedClient, config, json, timed_out};

    fn lenient() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            minimum_samples: 1_000,
            ..CircuitBreakerConfig::default()
        }
    }

    async fn send(harness: &Harness, request: Request<Body>) -> (StatusCode, header::HeaderMap, Vec<u8>) {
        let response = harness.router().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body.to_vec())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn proxies_with_prefix_stripped_and_correlation_forwarded() {
        let client = ScriptedClient::always(json(200, r#"{"hospitals":[]}"#));
        let harness = Harness::new(config(3, lenient()), client.clone());

        let request = Request::builder()
            .uri("/admin/hospitals?page=2")
            .header("x-request-id", "trace-42")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&harness, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, br#"{"hospitals":[]}"#);
        assert_eq!(headers.get("x-request-id").unwrap(), "trace-42");

        let upstream = &client.requests()[0];
        assert_eq!(
            upstream.uri.to_string(),
            "http://admin-service:3001/hospitals?page=2"
        );
        assert_eq!(upstream.headers.get("x-request-id").unwrap(), "trace-42");
    }

    #[tokio::test]
    async fn upstream_client_errors_pass_through_verbatim() {
        let client = ScriptedClient::always(json(404, r#"{"error":"patient not found"}"#));
        let harness = Harness::new(config(3, lenient()), client.clone());

        let (status, _, body) = send(&harness, get("/medico/patients/404")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, br#"{"error":"patient not found"}"#);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_prefix_is_route_not_found() {
        let harness = Harness::new(config(3, lenient()), ScriptedClient::always(json(200, "{}")));

        let (status, headers, body) = send(&harness, get("/billing/invoices")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "ROUTE_NOT_FOUND");
        assert_eq!(body["route"], "/billing/invoices");
        assert_eq!(body["method"], "GET");
        assert!(body["service"].is_null());
        assert_eq!(
            body["correlation_id"].as_str().unwrap(),
            headers.get("x-request-id").unwrap().to_str().unwrap()
        );
        assert!(chrono::DateTime::parse_from_rfc3339(body["timestamp"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_dispatch() {
        let client = ScriptedClient::always(json(201, "{}"));
        let mut config = config(3, lenient());
        config.max_body_bytes = 16;
        let harness = Harness::new(config, client.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/admin/appointments")
            .body(Body::from(vec![b'x'; 64]))
            .unwrap();
        let (status, _, body) = send(&harness, request).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "PAYLOAD_TOO_LARGE");
        assert_eq!(body["service"], "admin");
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_upstream_yields_normalized_503() {
        let client = ScriptedClient::always(json(500, "{}"));
        let harness = Harness::new(config(2, lenient()), client.clone());

        let (status, headers, body) = send(&harness, get("/admin/staff")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(headers.get(header::RETRY_AFTER).is_none());

        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "UPSTREAM_ERROR");
        assert_eq!(body["service"], "admin");
        assert_eq!(body["route"], "/admin/staff");
        assert_eq!(body["upstream_status"], 500);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_returns_retry_after() {
        let client = ScriptedClient::always(json(500, "{}"));
        let breaker = CircuitBreakerConfig {
            minimum_samples: 2,
            half_open_after_ms: 30_000,
            ..CircuitBreakerConfig::default()
        };
        let harness = Harness::new(config(1, breaker), client.clone());

        for _ in 0..2 {
            let request = Request::builder()
                .method("POST")
                .uri("/admin/appointments")
                .body(Body::from("{}"))
                .unwrap();
            send(&harness, request).await;
        }

        let (status, headers, body) = send(&harness, get("/admin/appointments")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "30");
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "CIRCUIT_OPEN");
        assert!(body.get("upstream_status").is_none());
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_get_is_answered_from_cache_with_stale_marker() {
        let client = ScriptedClient::always(json(200, r#"{"physicians":[7]}"#));
        let harness = Harness::new(config(1, lenient()), client.clone());

        let (status, _, _) = send(&harness, get("/medico/physicians")).await;
        assert_eq!(status, StatusCode::OK);

        client.set_default(json(503, "{}"));
        harness.clock.advance(Duration::from_secs(75));
        let (status, headers, body) = send(&harness, get("/medico/physicians")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-data-source").unwrap(), "cache");
        assert_eq!(headers.get("x-cache-status").unwrap(), "stale");
        assert_eq!(headers.get(header::AGE).unwrap(), "75");
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["stale"], true);
        assert_eq!(body["physicians"][0], 7);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_dispatch_hits_gateway_deadline() {
        let client = ScriptedClient::always(json(200, "{}"));
        client.set_delay(Duration::from_secs(5));
        let mut config = config(1, lenient());
        config.timeouts.gateway_ms = 100;
        let harness = Harness::new(config, client.clone());

        let (status, _, body) = send(&harness, get("/admin/reports")).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "GATEWAY_TIMEOUT");
    }

    #[tokio::test(start_paused = true)]
    async fn default_deadline_leaves_room_for_stale_fallback() {
        let client = ScriptedClient::always(json(200, r#"{"hospitals":["north"]}"#));
        let harness = Harness::new(config(3, lenient()), client.clone());
        let upstream_timeout = harness.gateway.config().timeouts.upstream();

        let (status, _, _) = send(&harness, get("/admin/hospitals")).await;
        assert_eq!(status, StatusCode::OK);

        // Every further attempt hangs until the per-call timeout gives up
        client.set_delay(upstream_timeout);
        client.set_default(timed_out(upstream_timeout));
        harness.clock.advance(Duration::from_secs(90));

        let (status, headers, body) = send(&harness, get("/admin/hospitals")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-data-source").unwrap(), "cache");
        assert_eq!(headers.get(header::AGE).unwrap(), "90");
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["hospitals"][0], "north");
        assert_eq!(client.calls(), 4);

        let breaker = harness.dispatcher.breakers().get("admin").await;
        assert_eq!(breaker.snapshot().failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_retries_after_current_attempt() {
        let client = ScriptedClient::always(json(503, "{}"));
        let harness = Harness::new(config(3, lenient()), client.clone());

        let shutdown = harness.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown.cancel();
        });

        let started = tokio::time::Instant::now();
        let (status, _, body) = send(&harness, get("/admin/staff")).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "UPSTREAM_ERROR");
        assert_eq!(client.calls(), 1);
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_serve_under_open_breaker_carries_retry_after() {
        let client = ScriptedClient::always(json(200, r#"{"wards":[]}"#));
        let breaker = CircuitBreakerConfig {
            minimum_samples: 2,
            half_open_after_ms: 120_000,
            ..CircuitBreakerConfig::default()
        };
        let harness = Harness::new(config(1, breaker), client.clone());

        send(&harness, get("/admin/wards")).await;
        client.set_default(json(500, "{}"));
        send(&harness, get("/admin/beds")).await;

        harness.clock.advance(Duration::from_secs(70));
        let (status, headers, _) = send(&harness, get("/admin/wards")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-data-source").unwrap(), "cache");
        assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "50");
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_and_passing_health_check_are_reported_independently() {
        let client = ScriptedClient::always(json(500, "{}"));
        let breaker = CircuitBreakerConfig {
            minimum_samples: 2,
            ..CircuitBreakerConfig::default()
        };
        let harness = Harness::new(config(1, breaker), client.clone());

        for _ in 0..2 {
            send(&harness, get("/admin/appointments")).await;
        }

        let (status, _, body) = send(&harness, get("/health/services")).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        let admin = body["services"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["service"] == "admin")
            .unwrap();
        assert_eq!(admin["healthy"], true);

        let (_, _, body) = send(&harness, get("/status")).await;
        let body: Value = serde_json::from_slice(&body).unwrap();
        let services = body["services"].as_array().unwrap();
        let admin = services.iter().find(|s| s["name"] == "admin").unwrap();
        let medico = services.iter().find(|s| s["name"] == "medico").unwrap();
        assert_eq!(admin["circuit"]["state"], "OPEN");
        assert_eq!(medico["circuit"]["state"], "CLOSED");
    }

    #[tokio::test]
    async fn status_reports_breakers_and_cache() {
        let harness = Harness::new(config(3, lenient()), ScriptedClient::always(json(200, "{}")));
        send(&harness, get("/admin/hospitals")).await;

        let (status, _, body) = send(&harness, get("/status")).await;
        assert_eq!(status, StatusCode::OK);

        let body: Value = serde_json::from_slice(&body).unwrap();
        let services = body["services"].as_array().unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0]["name"], "admin");
        assert_eq!(services[0]["circuit"]["state"], "CLOSED");
        assert_eq!(services[0]["circuit"]["total"], 1);
        assert_eq!(body["cache"]["entries"], 1);
    }

    #[tokio::test]
    async fn health_endpoints_report_probe_results() {
        let client = ScriptedClient::always(json(200, "{}"));
        let harness = Harness::new(config(3, lenient()), client.clone());

        let (status, _, body) = send(&harness, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "ok");

        let (status, _, body) = send(&harness, get("/health/services")).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["healthy"], 2);
        assert_eq!(body["services"][0]["endpoint"], "/health");

        client.set_health_status(StatusCode::SERVICE_UNAVAILABLE);
        let (status, _, body) = send(&harness, get("/health/services")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "degraded");
    }
}
