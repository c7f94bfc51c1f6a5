//! End-to-end tests for the cluster search service.
//!
//! These drive the full pipeline through the public surface only: handler
//! entry point in, ranked emissions out, with the three external
//! capabilities (fetch, decode, emit) mocked the way a host would supply
//! them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use clustra::{
    ClusterId, ClusterSearchService, DecodeError, DecodedQuery, EmbeddingFetcher, EmitError,
    FetchError, IngressError, IngressRequest, Neighbor, QueryBatchDecoder, RequestOrigin,
    ResultSink, SearchBackend, Settings, WorkerState,
};

/// Fetcher over a fixed cluster → embeddings map, counting calls per cluster.
#[derive(Default)]
struct MapFetcher {
    clusters: HashMap<u32, Vec<f32>>,
    calls: Mutex<HashMap<u32, usize>>,
}

impl MapFetcher {
    fn with_cluster(mut self, id: u32, vectors: Vec<f32>) -> Self {
        self.clusters.insert(id, vectors);
        self
    }

    fn calls_for(&self, id: u32) -> usize {
        self.calls.lock().get(&id).copied().unwrap_or(0)
    }
}

impl EmbeddingFetcher for MapFetcher {
    fn fetch_embeddings(&self, cluster: ClusterId) -> Result<Vec<f32>, FetchError> {
        *self.calls.lock().entry(cluster.get()).or_insert(0) += 1;
        self.clusters
            .get(&cluster.get())
            .cloned()
            .ok_or(FetchError::NoData(cluster))
    }
}

/// Wire format used by these tests: `[nq: u32][nq * dim f32][texts joined by '\n']`.
///
/// The real pipeline's format is the host's concern; this one exists only to
/// exercise a non-trivial decode path.
struct TestDecoder {
    dimension: usize,
}

impl QueryBatchDecoder for TestDecoder {
    fn decode(&self, payload: &[u8]) -> Result<Vec<DecodedQuery>, DecodeError> {
        let header: [u8; 4] = payload
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| DecodeError::Malformed("missing query count".to_string()))?;
        let nq = u32::from_le_bytes(header) as usize;

        let floats = nq * self.dimension;
        let body_end = 4 + floats * 4;
        let body = payload
            .get(4..body_end)
            .ok_or_else(|| DecodeError::Malformed("payload ended mid-vector".to_string()))?;

        let texts: Vec<&str> = if payload.len() > body_end {
            std::str::from_utf8(&payload[body_end..])
                .map_err(|e| DecodeError::Malformed(e.to_string()))?
                .split('\n')
                .collect()
        } else {
            Vec::new()
        };
        if texts.len() != nq {
            return Err(DecodeError::Malformed(format!(
                "{nq} vectors but {} texts",
                texts.len()
            )));
        }

        Ok((0..nq)
            .map(|q| {
                let embedding = body[q * self.dimension * 4..(q + 1) * self.dimension * 4]
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                DecodedQuery {
                    embedding,
                    text: texts[q].to_string(),
                }
            })
            .collect())
    }
}

fn encode_queries(dimension: usize, queries: &[(&[f32], &str)]) -> Vec<u8> {
    let mut payload = (queries.len() as u32).to_le_bytes().to_vec();
    for (embedding, _) in queries {
        assert_eq!(embedding.len(), dimension);
        for value in *embedding {
            payload.extend_from_slice(&value.to_le_bytes());
        }
    }
    let texts: Vec<&str> = queries.iter().map(|(_, text)| *text).collect();
    payload.extend_from_slice(texts.join("\n").as_bytes());
    payload
}

/// Sink recording every emission.
#[derive(Default)]
struct RecordingSink {
    emitted: Mutex<Vec<(RequestOrigin, String, Vec<Neighbor>)>>,
    count: AtomicUsize,
}

impl RecordingSink {
    fn wait_for(&self, count: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if self.count.load(Ordering::SeqCst) >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

impl ResultSink for RecordingSink {
    fn emit(
        &self,
        origin: &RequestOrigin,
        text: &str,
        neighbors: &[Neighbor],
    ) -> Result<(), EmitError> {
        self.emitted
            .lock()
            .push((origin.clone(), text.to_string(), neighbors.to_vec()));
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 64-dimensional one-hot vector: 1.0 at `hot`, zero elsewhere.
fn vec64(hot: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; 64];
    v[hot % 64] = 1.0;
    v
}

fn service_over(
    fetcher: Arc<MapFetcher>,
    settings: &Settings,
) -> (Arc<ClusterSearchService>, Arc<RecordingSink>) {
    // Captured per test; ignore the error when a subscriber is already set
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let sink = Arc::new(RecordingSink::default());
    let decoder = Arc::new(TestDecoder {
        dimension: settings.search.dimension,
    });
    let service =
        ClusterSearchService::new(settings, fetcher, decoder, sink.clone()).expect("valid config");
    (Arc::new(service), sink)
}

#[test]
fn test_cold_cluster_end_to_end() {
    // Cluster 7 holds eight 64-d vectors; defaults: dimension 64, top_k 4
    let mut embeddings = Vec::new();
    for i in 0..8 {
        embeddings.extend_from_slice(&vec64(i));
    }
    let fetcher = Arc::new(MapFetcher::default().with_cluster(7, embeddings));
    let settings = Settings::default();
    let (service, sink) = service_over(fetcher.clone(), &settings);

    let query = vec64(2);
    let payload = encode_queries(64, &[(&query, "what is cluster seven")]);
    service
        .handle(IngressRequest {
            sender: 11,
            path: "/rag/emb/clusters_search",
            key: "/rag/emb/cluster7/client5_qb0",
            payload: &payload,
        })
        .unwrap();

    assert!(sink.wait_for(1), "result never emitted");
    service.shutdown().unwrap();

    // The cold load fetched exactly once
    assert_eq!(fetcher.calls_for(7), 1);
    assert!(service.cache().is_populated(ClusterId::new(7)));

    let emitted = sink.emitted.lock();
    assert_eq!(emitted.len(), 1);

    let (origin, text, neighbors) = &emitted[0];
    assert_eq!(origin.sender, 11);
    assert_eq!(origin.client_id, Some(5));
    assert_eq!(origin.batch_id, Some(0));
    assert_eq!(text, "what is cluster seven");

    // Exactly top_k entries, nearest first: the query matches ordinal 2
    assert_eq!(neighbors.len(), 4);
    assert_eq!(neighbors[0].id.get(), 2);
    assert_eq!(neighbors[0].distance, 0.0);
    for pair in neighbors.windows(2) {
        assert!(pair[0].distance <= pair[1].distance);
    }
}

#[test]
fn test_failed_fetch_drops_request_and_retries() {
    // Cluster 3 is absent from the store at first
    let fetcher = Arc::new(MapFetcher::default());
    let settings = Settings::default();
    let (service, sink) = service_over(fetcher.clone(), &settings);

    let payload = encode_queries(64, &[(&vec64(0), "q")]);
    let request = IngressRequest {
        sender: 1,
        path: "/rag/emb/clusters_search",
        key: "/rag/emb/cluster3/client0_qb0",
        payload: &payload,
    };

    let err = service.handle(request).unwrap_err();
    assert!(matches!(err, IngressError::Load(_)));

    // Nothing cached, nothing emitted
    assert!(!service.cache().is_populated(ClusterId::new(3)));
    assert_eq!(sink.count.load(Ordering::SeqCst), 0);
    assert_eq!(fetcher.calls_for(3), 1);

    // A second request re-attempts the fetch (still failing here)
    let err = service.handle(request).unwrap_err();
    assert!(matches!(err, IngressError::Load(_)));
    assert_eq!(fetcher.calls_for(3), 2);

    service.shutdown().unwrap();
}

#[test]
fn test_concurrent_cold_requests_fetch_once() {
    let mut embeddings = Vec::new();
    for i in 0..4 {
        embeddings.extend_from_slice(&vec64(i));
    }
    let fetcher = Arc::new(MapFetcher::default().with_cluster(9, embeddings));
    let settings = Settings::default();
    let (service, sink) = service_over(fetcher.clone(), &settings);

    let producers = 8;
    let barrier = Arc::new(std::sync::Barrier::new(producers));
    let handles: Vec<_> = (0..producers)
        .map(|p| {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let payload = encode_queries(64, &[(&vec64(p), "q")]);
                barrier.wait();
                service
                    .handle(IngressRequest {
                        sender: p as u64,
                        path: "/rag/emb/clusters_search",
                        key: "/rag/emb/cluster9/client1_qb2",
                        payload: &payload,
                    })
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(sink.wait_for(producers), "missing emissions");
    service.shutdown().unwrap();

    assert_eq!(fetcher.calls_for(9), 1);
    assert_eq!(sink.emitted.lock().len(), producers);
}

#[test]
fn test_intra_cluster_order_preserved() {
    let mut embeddings = Vec::new();
    for i in 0..4 {
        embeddings.extend_from_slice(&vec64(i));
    }
    let fetcher = Arc::new(MapFetcher::default().with_cluster(1, embeddings));
    let settings = Settings::default();
    let (service, sink) = service_over(fetcher, &settings);

    // One request carrying three queries in order A, B, C
    let (a, b, c) = (vec64(0), vec64(1), vec64(2));
    let payload = encode_queries(64, &[(&a, "A"), (&b, "B"), (&c, "C")]);
    service
        .handle(IngressRequest {
            sender: 2,
            path: "/rag/emb/clusters_search",
            key: "/rag/emb/cluster1/client0_qb1",
            payload: &payload,
        })
        .unwrap();

    assert!(sink.wait_for(3), "missing emissions");
    service.shutdown().unwrap();

    let emitted = sink.emitted.lock();
    let texts: Vec<&str> = emitted.iter().map(|(_, text, _)| text.as_str()).collect();
    assert_eq!(texts, vec!["A", "B", "C"]);
}

#[test]
fn test_shutdown_with_late_items_completes() {
    let mut embeddings = Vec::new();
    for i in 0..4 {
        embeddings.extend_from_slice(&vec64(i));
    }
    let fetcher = Arc::new(MapFetcher::default().with_cluster(2, embeddings));
    let settings = Settings::default();
    let (service, sink) = service_over(fetcher, &settings);

    // Warm the cluster and the worker with one delivered query
    let payload = encode_queries(64, &[(&vec64(0), "warm")]);
    let key = "/rag/emb/cluster2/client0_qb0";
    service
        .handle(IngressRequest {
            sender: 1,
            path: "/rag/emb/clusters_search",
            key,
            payload: &payload,
        })
        .unwrap();
    assert!(sink.wait_for(1), "warm-up emission missing");

    // Race five late queries against teardown. Whether they land before or
    // after the worker observes the shutdown flag, their delivery is not
    // guaranteed; teardown completing without a hang is.
    let appender = {
        let service = Arc::clone(&service);
        std::thread::spawn(move || {
            let queries: Vec<Vec<f32>> = (0..5).map(vec64).collect();
            let encoded: Vec<(&[f32], &str)> = queries
                .iter()
                .map(|q| (q.as_slice(), "late"))
                .collect();
            let payload = encode_queries(64, &encoded);
            service
                .handle(IngressRequest {
                    sender: 1,
                    path: "/rag/emb/clusters_search",
                    key,
                    payload: &payload,
                })
                .unwrap();
        })
    };

    let started = Instant::now();
    service.shutdown().unwrap();
    appender.join().unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "teardown hung on undrained items"
    );
    assert_eq!(service.worker_state(), WorkerState::Stopped);
}

#[test]
fn test_backends_produce_identical_rankings() {
    // Same data and queries through all three backends; nprobe covers
    // every list so even IVF is exact
    let mut embeddings = Vec::new();
    for i in 0..16 {
        embeddings.extend_from_slice(&vec64(i));
    }

    let mut rankings = Vec::new();
    for backend in [
        SearchBackend::Flat,
        SearchBackend::ParallelFlat,
        SearchBackend::IvfFlat,
    ] {
        let fetcher = Arc::new(MapFetcher::default().with_cluster(4, embeddings.clone()));
        let mut settings = Settings::default();
        settings.search.backend = backend;
        settings.search.nprobe = usize::MAX;
        let (service, sink) = service_over(fetcher, &settings);

        let payload = encode_queries(64, &[(&vec64(5), "q5"), (&vec64(13), "q13")]);
        service
            .handle(IngressRequest {
                sender: 1,
                path: "/rag/emb/clusters_search",
                key: "/rag/emb/cluster4/client0_qb0",
                payload: &payload,
            })
            .unwrap();

        assert!(sink.wait_for(2), "missing emissions for {backend:?}");
        service.shutdown().unwrap();

        let emitted = sink.emitted.lock();
        let mut ranked: Vec<(String, Vec<u32>)> = emitted
            .iter()
            .map(|(_, text, neighbors)| {
                (
                    text.clone(),
                    neighbors.iter().map(|n| n.id.get()).collect(),
                )
            })
            .collect();
        ranked.sort();
        rankings.push(ranked);
    }

    assert_eq!(rankings[0], rankings[1]);
    assert_eq!(rankings[0], rankings[2]);
}
