use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::fingerprint::compute_tlsh;
use crate::store::Store;

/// External images below this size are discarded; trackers and logos are not
/// worth a fingerprint.
pub const MIN_EXTERNAL_IMAGE_SIZE: usize = 40 * 1024;
pub const MAX_EXTERNAL_IMAGES: usize = 10;

const MAX_IMAGE_READ: usize = 10 * 1024 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const WALL_BUDGET: Duration = Duration::from_secs(5);
const MAX_CONCURRENT_FETCHES: usize = 5;
const SPARSE_TEXT_WORDS: usize = 10;

lazy_static! {
    static ref RE_IMG_SRC: Regex =
        Regex::new(r#"(?i)<img[^>]+src=["'](https?://[^"']+)["'][^>]*>"#).unwrap();
    static ref RE_TAG: Regex = Regex::new(r"<[^>]*>").unwrap();
}

/// The sidechannel only runs for near-textless HTML: image-only spam hides
/// its payload in a hero image precisely because there is nothing to read.
pub fn should_analyze_images(html: &str) -> bool {
    let text = RE_TAG.replace_all(html, " ");
    text.split_whitespace().count() < SPARSE_TEXT_WORDS
}

/// Unique absolute `http(s)` image URLs in document order, capped at
/// `MAX_EXTERNAL_IMAGES`. Relative URLs never match.
pub fn extract_image_urls(html: &str) -> Vec<String> {
    let mut urls = Vec::with_capacity(MAX_EXTERNAL_IMAGES);
    for captures in RE_IMG_SRC.captures_iter(html) {
        if let Some(url) = captures.get(1) {
            let url = url.as_str().to_string();
            if !urls.contains(&url) {
                urls.push(url);
                if urls.len() >= MAX_EXTERNAL_IMAGES {
                    break;
                }
            }
        }
    }
    urls
}

struct Candidate {
    url: String,
    size: u64,
    data: Option<Vec<u8>>,
    digest: Option<String>,
}

pub struct ImageAnalyzer {
    http: Client,
}

impl ImageAnalyzer {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(format!("mailuminati-guardian/{}", crate::ENGINE_VERSION))
            .build()?;
        Ok(Self { http })
    }

    /// Fetch the message's external images concurrently (at most five in
    /// flight, five seconds wall budget) and return the TLSH digest of the
    /// single largest candidate, consulting and feeding the size|digest
    /// cache. `None` when nothing usable survives the limits.
    pub async fn best_image_digest(&self, store: &Store, html: &str) -> Option<String> {
        let urls = extract_image_urls(html);
        if urls.is_empty() {
            return None;
        }
        debug!(candidate_count = urls.len(), "image analysis triggered");

        let best: Arc<Mutex<Option<Candidate>>> = Arc::new(Mutex::new(None));
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_FETCHES));
        let mut tasks = tokio::task::JoinSet::new();

        for url in urls {
            let http = self.http.clone();
            let store = store.clone();
            let best = Arc::clone(&best);
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if let Some(candidate) = fetch_image(&http, &store, &url).await {
                    let mut slot = best.lock().unwrap();
                    let larger = slot
                        .as_ref()
                        .map(|current| candidate.size > current.size)
                        .unwrap_or(true);
                    if larger {
                        *slot = Some(candidate);
                    }
                }
            });
        }

        let drained = tokio::time::timeout(WALL_BUDGET, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            debug!("image fetch wall budget expired");
            tasks.abort_all();
        }

        let winner = best.lock().unwrap().take()?;
        debug!(url = %winner.url, size = winner.size, "selected best image");

        if let Some(digest) = winner.digest {
            return Some(digest);
        }

        let data = winner.data?;
        let digest = match compute_tlsh(&data) {
            Some(digest) => digest,
            None => {
                warn!(url = %winner.url, "failed to compute TLSH for image");
                return None;
            }
        };
        if let Err(e) = store.image_cache_put(&winner.url, winner.size, &digest).await {
            warn!(url = %winner.url, error = %e, "failed to cache image digest");
        }
        Some(digest)
    }
}

async fn fetch_image(http: &Client, store: &Store, url: &str) -> Option<Candidate> {
    match store.image_cache_get(url).await {
        Ok(Some((size, digest))) => {
            debug!(url, size, "image cache hit");
            return Some(Candidate {
                url: url.to_string(),
                size,
                data: None,
                digest: Some(digest),
            });
        }
        Ok(None) => {}
        Err(e) => debug!(url, error = %e, "image cache unavailable"),
    }

    debug!(url, "fetching image");
    let mut response = match http.get(url).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(url, error = %e, "image fetch error");
            return None;
        }
    };
    if !response.status().is_success() {
        warn!(url, status = %response.status(), "image fetch rejected");
        return None;
    }

    let mut data = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                data.extend_from_slice(&chunk);
                if data.len() >= MAX_IMAGE_READ {
                    data.truncate(MAX_IMAGE_READ);
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(url, error = %e, "image read error");
                return None;
            }
        }
    }

    if data.len() < MIN_EXTERNAL_IMAGE_SIZE {
        debug!(url, size = data.len(), "skipped image (too small)");
        return None;
    }

    Some(Candidate {
        url: url.to_string(),
        size: data.len() as u64,
        data: Some(data),
        digest: None,
    })
}
