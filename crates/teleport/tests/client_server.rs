//! End-to-end scenarios: request/response traffic, batching, concurrency
//! admission and ordering over a single multiplexed connection.

mod common;

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures::future::join_all;
use http::StatusCode;
use teleport::{make_handler, Body, Request, Response, ServerConfig};
use tokio::sync::{mpsc, watch};

#[tokio::test]
async fn get_host_echo_serial() {
    let server = TestServer::start(ServerConfig::default(), echo_host_handler());
    let client = server.client();

    for i in 0..100 {
        let host = format!("foobar{i}.com");
        let response = client
            .do_timeout(get_request(&host), Duration::from_secs(1))
            .await
            .unwrap_or_else(|e| panic!("unexpected error on iteration {i}: {e}"));
        assert_eq!(response.status(), StatusCode::OK, "iteration {i}");
        assert_eq!(body_text(&response), host, "iteration {i}");
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_host_echo_concurrent() {
    let server = TestServer::start(ServerConfig::default(), echo_host_handler());
    let client = Arc::new(server.client());

    let mut tasks = Vec::new();
    for task_id in 0..10 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..10 {
                let host = format!("foobar{task_id}x{i}.com");
                let response =
                    client.do_timeout(get_request(&host), Duration::from_secs(1)).await?;
                assert_eq!(response.status(), StatusCode::OK);
                assert_eq!(body_text(&response), host);
            }
            Ok::<(), teleport::Error>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    server.stop().await;
}

#[tokio::test]
async fn post_body_echo() {
    let server = TestServer::start(ServerConfig::default(), echo_body_handler());
    let client = server.client();

    for i in 0..100 {
        let body = format!("body number {i}");
        let response = client
            .do_timeout(post_request(body.clone()), Duration::from_secs(1))
            .await
            .unwrap_or_else(|e| panic!("unexpected error on iteration {i}: {e}"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(&response), body);
    }

    server.stop().await;
}

#[tokio::test]
async fn batch_delay_roundtrips_within_deadline() {
    let config = ServerConfig { max_batch_delay: Duration::from_millis(10), ..Default::default() };
    let server = TestServer::start(config, echo_host_handler());
    let client =
        server.client_with(|config| config.max_batch_delay = Duration::from_millis(10));

    for i in 0..10 {
        let host = format!("foobar{i}.com");
        let response = client
            .do_timeout(get_request(&host), Duration::from_secs(1))
            .await
            .unwrap_or_else(|e| panic!("unexpected error on iteration {i}: {e}"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(&response), host);
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_limit_answers_429() {
    const CONCURRENCY: usize = 10;

    let (release_tx, release_rx) = watch::channel(false);
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let handler = make_handler(move |_req: Request| {
        let mut release = release_rx.clone();
        let entered = entered_tx.clone();
        async move {
            let _ = entered.send(());
            let _ = release.wait_for(|released| *released).await;
            Ok::<_, Infallible>(Response::new(Body::from("done")))
        }
    });

    let config = ServerConfig { concurrency: CONCURRENCY, ..Default::default() };
    let server = TestServer::start(config, handler);
    let client = Arc::new(server.client());

    // fill the server with blocking handler invocations
    let mut blocked = Vec::new();
    for _ in 0..CONCURRENCY {
        let client = client.clone();
        blocked.push(tokio::spawn(async move {
            client.do_timeout(get_request("foobar.com"), Duration::from_secs(3600)).await
        }));
    }
    for i in 0..CONCURRENCY {
        tokio::time::timeout(Duration::from_secs(3), entered_rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timeout waiting for handler {i} to start"))
            .expect("handler entry signal");
    }

    // every further request is answered with the 429-equivalent
    for i in 0..100 {
        let response = client
            .do_timeout(get_request("aaa.bbb"), Duration::from_secs(1))
            .await
            .unwrap_or_else(|e| panic!("unexpected error on iteration {i}: {e}"));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS, "iteration {i}");
        assert!(
            body_text(&response).contains("concurrency limit exceeded: 10"),
            "iteration {i}: {}",
            body_text(&response)
        );
    }

    // unblock the original requests; they must all complete normally
    release_tx.send(true).expect("handlers are still waiting");
    for task in blocked {
        let response = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("blocked request should finish after release")
            .expect("task panicked")
            .expect("blocked request should succeed");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(&response), "done");
    }

    server.stop().await;
}

#[tokio::test]
async fn pipelined_responses_keep_request_order() {
    let sequence = Arc::new(AtomicUsize::new(0));
    let handler = {
        let sequence = sequence.clone();
        make_handler(move |_req: Request| {
            let sequence = sequence.clone();
            async move {
                let seq = sequence.fetch_add(1, Ordering::SeqCst);
                if seq == 0 {
                    // a slow first request must not let later ones overtake
                    tokio::time::sleep(Duration::from_millis(30)).await;
                }
                Ok::<_, Infallible>(Response::new(Body::from(seq.to_string())))
            }
        })
    };

    let config = ServerConfig { pipeline_requests: true, ..Default::default() };
    let server = TestServer::start(config, handler);
    let client = server.client();

    let calls: Vec<_> = (0..10)
        .map(|_| client.do_timeout(get_request("foobar.com"), Duration::from_secs(2)))
        .collect();
    let responses = join_all(calls).await;

    for (i, result) in responses.into_iter().enumerate() {
        let response = result.unwrap_or_else(|e| panic!("unexpected error on request {i}: {e}"));
        assert_eq!(body_text(&response), i.to_string(), "request {i} was reordered");
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_handler_does_not_block_fast_ones() {
    let handler = make_handler(|req: Request| async move {
        if req.body().as_bytes().map(|b| b.as_ref()) == Some(b"slow".as_ref()) {
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        Ok::<_, Infallible>(Response::new(req.into_body()))
    });
    let server = TestServer::start(ServerConfig::default(), handler);
    let client = Arc::new(server.client());

    let slow = {
        let client = client.clone();
        tokio::spawn(async move {
            let response =
                client.do_timeout(post_request("slow"), Duration::from_secs(2)).await.unwrap();
            (tokio::time::Instant::now(), response)
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let fast = {
        let client = client.clone();
        tokio::spawn(async move {
            let response =
                client.do_timeout(post_request("fast"), Duration::from_secs(2)).await.unwrap();
            (tokio::time::Instant::now(), response)
        })
    };

    let (slow_done, slow_response) = slow.await.unwrap();
    let (fast_done, fast_response) = fast.await.unwrap();
    assert_eq!(body_text(&slow_response), "slow");
    assert_eq!(body_text(&fast_response), "fast");
    assert!(
        fast_done < slow_done,
        "the fast response should overtake the slow one on the same connection"
    );

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multiple_clients_share_one_server() {
    let server = TestServer::start(ServerConfig::default(), sleep_handler());

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let client = server.client();
        tasks.push(tokio::spawn(async move {
            for i in 0..10 {
                let response =
                    client.do_timeout(get_request("foobar.com"), Duration::from_secs(1)).await?;
                assert_eq!(response.status(), StatusCode::OK, "iteration {i}");
                assert!(
                    body_text(&response).starts_with("slept for "),
                    "iteration {i}: {}",
                    body_text(&response)
                );
            }
            Ok::<(), teleport::Error>(())
        }));
    }

    let started = tokio::time::Instant::now();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "sleep-handler traffic took {:?}",
        started.elapsed()
    );

    server.stop().await;
}
