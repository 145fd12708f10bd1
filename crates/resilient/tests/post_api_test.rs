//! Integration tests for the HTTP client path against an in-memory post API
//!
//! Run with: cargo test -p resilient --test post_api_test

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_test::{assert_err, assert_ok};

use resilient::prelude::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Post {
    id: u64,
    title: String,
    body: String,
}

impl Post {
    fn placeholder() -> Self {
        Self {
            id: 0,
            title: "Post unavailable".into(),
            body: String::new(),
        }
    }
}

/// Owned post storage served over a fake transport
///
/// `outages` makes the next N requests fail with a 503 before the store is consulted.
struct PostApi {
    posts: Mutex<HashMap<u64, Post>>,
    outages: AtomicU32,
    requests: AtomicU32,
}

impl PostApi {
    fn seeded() -> Arc<Self> {
        let posts = (1..=3)
            .map(|id| {
                (
                    id,
                    Post {
                        id,
                        title: format!("Post {id}"),
                        body: format!("Body of post {id}"),
                    },
                )
            })
            .collect();
        Arc::new(Self {
            posts: Mutex::new(posts),
            outages: AtomicU32::new(0),
            requests: AtomicU32::new(0),
        })
    }

    fn fail_next(&self, n: u32) {
        self.outages.store(n, Ordering::SeqCst);
    }

    fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for PostApi {
    async fn send(&self, request: HttpRequest) -> Result<RawResponse, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        if self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(RawResponse::new(503, "unavailable"));
        }

        let id = request
            .url
            .rsplit_once("/posts/")
            .and_then(|(_, id)| id.parse::<u64>().ok())
            .ok_or_else(|| TransportError::Protocol(format!("no route for {}", request.url)))?;

        let post = self.posts.lock().unwrap().get(&id).cloned();
        match post {
            Some(post) => Ok(RawResponse::json(&post).unwrap()),
            None => Ok(RawResponse::new(404, "")),
        }
    }
}

fn client(api: &Arc<PostApi>) -> HttpClient<PostApi> {
    HttpClient::new("https://posts.test/", api.clone())
}

fn get_post(client: &HttpClient<PostApi>, id: u64) -> impl Operation<Output = Post, Error = AppError> {
    client.json_operation::<Post>(HttpRequest::get(client.url(&format!("/posts/{id}"))))
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_missing_post_falls_back_to_placeholder() {
    let api = PostApi::seeded();
    let client = client(&api);

    let post = get_post(&client, 999)
        .with_retry(RetryPolicy::exponential())
        .with_timeout(Duration::from_secs(2))
        .with_fallback_value(Post::placeholder())
        .call()
        .await;

    assert_eq!(assert_ok!(post), Post::placeholder());
    // NotFound is never retried
    assert_eq!(api.requests(), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_missing_post_without_fallback_is_not_found() {
    let api = PostApi::seeded();
    let client = client(&api);

    let err = assert_err!(get_post(&client, 999).with_retry(RetryPolicy::exponential()).call().await);

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!err.is_retryable());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_outage_is_retried_through() {
    let api = PostApi::seeded();
    api.fail_next(2);
    let client = client(&api);

    let post = get_post(&client, 2)
        .with_retry(RetryPolicy::exponential().with_jitter(false))
        .call()
        .await;

    assert_eq!(assert_ok!(post).title, "Post 2");
    assert_eq!(api.requests(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_value_after_exhausted_outage() {
    let api = PostApi::seeded();
    api.fail_next(10);
    let client = client(&api);

    let runner = OperationRunner::new(RunPolicy::new(
        RetryPolicy::exponential().with_max_attempts(3).with_jitter(false),
    ));
    let post = runner
        .run_with_fallback(get_post(&client, 1), Post::placeholder())
        .await;

    assert_eq!(post, Post::placeholder());
    assert_eq!(api.requests(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_batch_fetch_keeps_request_order() {
    let api = PostApi::seeded();
    let client = client(&api);

    let ops: Vec<_> = [3, 999, 1].iter().map(|id| get_post(&client, *id).boxed()).collect();
    let results = run_all_settled(ops, 2).await;

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().map(|p| p.id), Ok(3));
    assert_eq!(results[1].as_ref().unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(results[2].as_ref().map(|p| p.id), Ok(1));

    let ops: Vec<_> = [3, 999, 1].iter().map(|id| get_post(&client, *id).boxed()).collect();
    let err = assert_err!(run_all(ops, 1).await);
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
