use std::time::Duration;

use cobalt_cascade::{
    cascade::GET_WAITING_DATA,
    net::{loopback::RemoteEnd, CorrelationId, Domain, RemoteError, ResponseEnvelope},
    sort::{SortRequest, NO_MORE_PAGES},
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

const POSTS_PER_PAGE: i64 = 3;

/// How the simulated data store behaves.
#[derive(Clone, Debug)]
pub struct Script {
    pub pages: i64,
    /// Fails this page the first time it is asked for.
    pub fail_page: Option<i64>,
    /// Answers this page only after the given delay.
    pub slow_page: Option<(i64, Duration)>,
    /// Unix time the user last looked at anything.
    pub last_viewed: i64,
}

/// Plays the user's data store until the client goes away.
pub async fn serve(mut remote: RemoteEnd, domus: Domain, script: Script) {
    let mut failed = false;
    while let Some((target, request)) = remote.next_request().await {
        if target != domus {
            warn!(domain = %target, kind = %request.kind, "no simulated domain answers here");
            continue;
        }
        let id = request.correlation_id.clone();
        let response = match request.kind.as_str() {
            GET_WAITING_DATA => {
                let cell = json!({"timestamp": script.last_viewed.to_string()});
                ResponseEnvelope::success(id, json!({
                    "public_client": cell.clone(),
                    "private_client": cell.clone(),
                    "public_global": cell.clone(),
                    "private_global": cell,
                }))
            }
            SortRequest::KIND => {
                let page = request.payload["private_page"].as_i64().unwrap_or(1);
                let sort_type = request.payload["type"].as_str().unwrap_or("unknown");
                debug!(sort_type, page, "sorting");

                if script.fail_page == Some(page) && !failed {
                    failed = true;
                    ResponseEnvelope::failure(id, RemoteError {
                        message: format!("rhythm failed on page {page}"),
                        stack: Some("at rank (newest.js:17)".to_string()),
                    })
                } else {
                    if let Some((slow, delay)) = script.slow_page {
                        if slow == page {
                            info!(page, ?delay, "holding the response back");
                            tokio::time::sleep(delay).await;
                        }
                    }
                    sort_page(id, sort_type, page, &script)
                }
            }
            other => {
                warn!(kind = other, "unknown action");
                ResponseEnvelope::failure(id, RemoteError {
                    message: format!("unknown action {other}"),
                    stack: None,
                })
            }
        };
        if let Err(e) = remote.reply(&domus, &response) {
            warn!(error = %e, "client has gone away");
            return;
        }
    }
}

fn sort_page(
    id: CorrelationId,
    sort_type: &str,
    page: i64,
    script: &Script,
) -> ResponseEnvelope {
    if page > script.pages {
        return ResponseEnvelope::success(id, json!({"posts": [], "page": NO_MORE_PAGES}));
    }

    let posts: Value = (0..POSTS_PER_PAGE)
        .map(|i| {
            let n = (page - 1) * POSTS_PER_PAGE + i;
            json!({
                "post_id": format!("{sort_type}-{n}"),
                "status": if n % 2 == 0 { "public" } else { "private" },
                "timestamp": (script.last_viewed + 60 - n * 30).to_string(),
                "title": format!("post {n}"),
            })
        })
        .collect();

    // later pages arrive as deltas onto what is already shown
    if page == 1 {
        ResponseEnvelope::success(id, json!({"posts": posts, "page": page}))
    } else {
        ResponseEnvelope::update(id, json!({"posts": posts, "page": page}))
    }
}
