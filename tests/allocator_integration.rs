//! Integration tests for identifier allocation under concurrency

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use tally_store::{Config, LocalStore, SequenceAllocator, TallyService};
use tempfile::TempDir;

fn prepared_service(temp_dir: &TempDir) -> TallyService {
    let config = Config {
        storage_dir: temp_dir.path().to_path_buf(),
        ..Default::default()
    };
    let service = TallyService::open(config).unwrap();
    service.prepare_store().unwrap();
    service
}

/// Test 1000 concurrent same-prefix allocations never share a number
#[test]
fn test_concurrent_same_prefix_allocations_are_unique() {
    let temp_dir = TempDir::new().unwrap();
    let service = prepared_service(&temp_dir);
    let allocator = service.allocator().clone();

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let allocator = allocator.clone();
            thread::spawn(move || {
                (0..125)
                    .map(|i| {
                        allocator
                            .allocate("John Doe", &format!("w{}-{}", worker, i))
                            .unwrap()
                            .into_string()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(ids.insert(id.clone()), "duplicate identifier {}", id);
        }
    }
    assert_eq!(ids.len(), 1000);

    // Numbers are exactly 1..=1000, widening past three digits
    let mut numbers: Vec<u64> = ids
        .iter()
        .map(|id| {
            assert!(id.starts_with("JD"));
            id[2..].parse().unwrap()
        })
        .collect();
    numbers.sort_unstable();
    assert_eq!(numbers, (1..=1000).collect::<Vec<u64>>());
    assert!(ids.contains("JD999"));
    assert!(ids.contains("JD1000"));
}

/// Test separate connections to the same file do not hand out the same identifier
#[test]
fn test_allocations_across_connections() {
    let temp_dir = TempDir::new().unwrap();
    let service = prepared_service(&temp_dir);
    let path = service.config().database_path();

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let path = path.clone();
            thread::spawn(move || {
                let store = Arc::new(LocalStore::open(&path).unwrap());
                let allocator = SequenceAllocator::new(store, 3, 20);
                (0..25)
                    .map(|i| {
                        allocator
                            .allocate("Mary Ann", &format!("c{}-{}", worker, i))
                            .unwrap()
                            .into_string()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(ids.insert(id));
        }
    }
    assert_eq!(ids.len(), 100);
}

/// Test racing retries of one submission all get the same identifier
#[test]
fn test_concurrent_retries_of_one_submission() {
    let temp_dir = TempDir::new().unwrap();
    let service = prepared_service(&temp_dir);
    let allocator = service.allocator().clone();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let allocator = allocator.clone();
            // Name varies between retries; the key decides
            thread::spawn(move || allocator.allocate(&format!("Jane {}", i), "uuid-123").unwrap())
        })
        .collect();

    let ids: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(ids.len(), 1);

    let next = allocator.allocate("Zed Zulu", "uuid-124").unwrap();
    assert_eq!(next.as_str(), "ZZ001");
}

/// Test allocations survive reopening the database
#[test]
fn test_counter_persists_across_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let service = prepared_service(&temp_dir);
        assert_eq!(service.allocator().allocate("Ann Bee", "a").unwrap().as_str(), "AB001");
    }

    let service = prepared_service(&temp_dir);
    assert_eq!(service.allocator().allocate("Ann Bee", "b").unwrap().as_str(), "AB002");
    assert_eq!(service.allocator().allocate("Ann Bee", "a").unwrap().as_str(), "AB001");
}
