use pulse_core::index::InvertedIndex;
use pulse_core::{
    Admission, DataDir, DocumentId, KvStore, ManualClock, MemoryStore, NewDocument, SearchService, ServiceConfig,
    SledDocumentStore, Tokenizer,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use time::macros::datetime;

struct Harness {
    service: SearchService,
    clock: Arc<ManualClock>,
}

fn harness_with(store: Arc<dyn KvStore>) -> Harness {
    let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00:30 UTC)));
    let service = SearchService::new(
        store,
        Arc::new(SledDocumentStore::temporary().unwrap()),
        clock.clone(),
        Tokenizer::default(),
        ServiceConfig::default(),
    );
    Harness { service, clock }
}

fn harness() -> Harness {
    harness_with(Arc::new(MemoryStore::new()))
}

fn doc(title: &str, content: &str) -> NewDocument {
    NewDocument { title: title.to_string(), content: content.to_string(), tags: vec![] }
}

#[tokio::test]
async fn disjoint_vocabularies_do_not_cross_match() {
    let h = harness();
    let a = h.service.add_document(doc("A", "alpha bravo")).await.unwrap();
    let b = h.service.add_document(doc("B", "charlie delta")).await.unwrap();
    h.service.add_document(doc("C", "echo foxtrot")).await.unwrap();

    let hits = h.service.search("alpha", 1).await.unwrap();
    assert_eq!(hits.iter().map(|d| d.id).collect::<Vec<_>>(), vec![a.id]);
    let hits = h.service.search("delta", 1).await.unwrap();
    assert_eq!(hits.iter().map(|d| d.id).collect::<Vec<_>>(), vec![b.id]);
}

#[tokio::test]
async fn posting_holds_occurrence_count() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let index = InvertedIndex::new(store, Tokenizer::default());
    let id = DocumentId::new();
    index.add_document(&id, "Echo echo ECHO, foxtrot").await.unwrap();

    assert_eq!(index.term_frequency("echo", &id).await.unwrap(), Some(3.0));
    assert_eq!(index.term_frequency("foxtrot", &id).await.unwrap(), Some(1.0));
    assert_eq!(index.total_documents().await.unwrap(), 1);
}

#[tokio::test]
async fn single_term_pages_do_not_overlap() {
    let h = harness();
    for i in 0..15 {
        let body = format!("{} tail", "paging ".repeat(i + 1));
        h.service.add_document(doc(&format!("doc {i}"), &body)).await.unwrap();
    }
    h.service.add_document(doc("filler", "nothing shared")).await.unwrap();
    h.service.add_document(doc("filler", "still nothing")).await.unwrap();

    let first = h.service.search("paging", 1).await.unwrap();
    let second = h.service.search("paging", 2).await.unwrap();
    assert_eq!(first.len(), 10);
    assert_eq!(second.len(), 5);

    let first_ids: HashSet<_> = first.iter().map(|d| d.id).collect();
    assert!(second.iter().all(|d| !first_ids.contains(&d.id)));
    // heavier postings come first
    assert_eq!(first[0].title, "doc 14");
    assert!(h.service.search("paging", 3).await.unwrap().is_empty());
}

#[tokio::test]
async fn typeahead_needs_three_characters() {
    let h = harness();
    assert!(h.service.add_term("search", 5.0).await.unwrap());
    assert!(h.service.add_term("seaside", 2.0).await.unwrap());

    assert_eq!(h.service.suggestions("sea", Some(1)).await.unwrap(), vec!["search"]);
    assert_eq!(h.service.suggestions("sea", None).await.unwrap(), vec!["search", "seaside"]);
    assert!(h.service.suggestions("se", Some(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn limiter_allows_burst_then_one_after_two_seconds() {
    let h = harness();
    for _ in 0..5 {
        assert_eq!(h.service.admit("192.0.2.7").await, Admission::Allowed);
    }
    assert_eq!(h.service.admit("192.0.2.7").await, Admission::Denied);

    h.clock.advance(Duration::from_secs(2));
    assert_eq!(h.service.admit("192.0.2.7").await, Admission::Allowed);
    assert_eq!(h.service.admit("192.0.2.7").await, Admission::Denied);
}

#[tokio::test]
async fn view_trends_then_decays_out_of_the_window() {
    let h = harness();
    let added = h.service.add_document(doc("Hot take", "controversial opinion")).await.unwrap();
    let id = added.id.to_string();

    let before = h.service.trending_engine().score(&added.id).await.unwrap();
    h.service.get_document(&id).await.unwrap();
    let after = h.service.trending_engine().score(&added.id).await.unwrap();
    assert_eq!(after, before + 1.0);

    let trending = h.service.trending(Some(50)).await.unwrap();
    assert_eq!(trending.len(), 1);
    assert_eq!(trending[0].id, id);
    assert_eq!(trending[0].views, 1);

    h.clock.advance(Duration::from_secs(61 * 60));
    h.service.trending_engine().decay_tick().await.unwrap();
    assert_eq!(h.service.trending_engine().score(&added.id).await.unwrap(), before);

    // a second tick in the same minute changes nothing
    let again = h.service.trending_engine().decay_tick().await.unwrap();
    assert_eq!(again.buckets, 0);
    assert!(h.service.trending(None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_additions_lose_no_updates() {
    let h = harness();
    let service = Arc::new(h.service);
    let adds: Vec<_> = (0..50)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                service.add_document(doc(&format!("doc {i}"), &format!("shared unique{i}"))).await
            })
        })
        .collect();
    for add in adds {
        assert!(add.await.unwrap().unwrap().indexed_immediately);
    }

    let index = service.pipeline().index();
    assert_eq!(index.total_documents().await.unwrap(), 50);
    assert_eq!(service.document_count().await.unwrap(), 50);
    assert_eq!(service.search("unique17", 1).await.unwrap().len(), 1);
    let mut seen = 0;
    for page in 1..=5 {
        seen += service.search("shared", page).await.unwrap().len();
    }
    assert_eq!(seen, 50);
}

#[tokio::test]
async fn index_state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00:30 UTC)));
    let open = |data: &DataDir| {
        SearchService::new(
            data.keyspace(),
            data.documents(),
            clock.clone(),
            Tokenizer::default(),
            ServiceConfig::default(),
        )
    };

    let added = {
        let data = DataDir::open(dir.path()).unwrap();
        let service = open(&data);
        let added = service.add_document(doc("Walrus", "the walrus basks")).await.unwrap();
        service.add_document(doc("Seal", "the seal swims")).await.unwrap();
        service.get_document(&added.id.to_string()).await.unwrap();
        data.flush().unwrap();
        added
    };

    let data = DataDir::open(dir.path()).unwrap();
    let service = open(&data);
    let hits = service.search("walrus", 1).await.unwrap();
    assert_eq!(hits.iter().map(|d| d.id).collect::<Vec<_>>(), vec![added.id]);
    assert_eq!(service.pipeline().index().total_documents().await.unwrap(), 2);
    let trending = service.trending(None).await.unwrap();
    assert_eq!(trending.len(), 1);
    assert_eq!(trending[0].views, 1);
}
