//! End-to-end scenarios across the connection, recovery unit, record store
//! and index layers.

use kvlayer_core::{
    CoreError, EngineConnection, EngineOptions, FnChange, IndexKey, LockMode, OperationContext,
    ProcessContext, RecordId, WriteUnitOfWork,
};
use kvlayer_storage::{InMemoryEngine, KvEngine};
use kvlayer_testkit::prelude::*;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn counted_engine() -> (Arc<InMemoryEngine>, OperationContext) {
    let engine = Arc::new(InMemoryEngine::open(None, "create").unwrap());
    let conn = EngineConnection::with_engine(
        Arc::clone(&engine) as Arc<dyn KvEngine>,
        EngineOptions::new().durable(false),
    )
    .unwrap();
    let process = ProcessContext::new(Arc::new(conn));
    (engine, OperationContext::new(process, 1))
}

#[test]
fn nested_units_commit_once() {
    init_tracing();
    let (engine, mut opctx) = counted_engine();
    opctx.process().connection().create_record_store("r1", &Default::default()).unwrap();
    let store = opctx.process().connection().get_record_store("r1", &Default::default());
    let before = engine.commit_seq();

    let mut outer = WriteUnitOfWork::new(&mut opctx).unwrap();
    store.insert_record(&mut outer, b"one").unwrap();
    {
        let mut inner = WriteUnitOfWork::new(&mut outer).unwrap();
        assert_eq!(inner.recovery_unit_depth(), 2);
        store.insert_record(&mut inner, b"two").unwrap();
        inner.commit().unwrap();
    }
    assert_eq!(engine.commit_seq(), before);
    outer.commit().unwrap();
    assert_eq!(engine.commit_seq(), before + 1);
}

#[test]
fn changes_commit_in_order_and_roll_back_in_reverse() {
    let engine = TestEngine::memory();
    let mut opctx = engine.opctx();
    let log = Arc::new(Mutex::new(Vec::new()));

    let register = |opctx: &mut OperationContext, name: &'static str| {
        let (c, r) = (Arc::clone(&log), Arc::clone(&log));
        opctx.recovery_unit().register_change(Box::new(
            FnChange::new()
                .on_commit(move || c.lock().push(format!("commit {name}")))
                .on_rollback(move || r.lock().push(format!("rollback {name}"))),
        ));
    };

    let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
    register(&mut wuow, "a");
    register(&mut wuow, "b");
    wuow.commit().unwrap();
    assert_eq!(*log.lock(), vec!["commit a", "commit b"]);

    log.lock().clear();
    {
        let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
        register(&mut wuow, "a");
        register(&mut wuow, "b");
    }
    assert_eq!(*log.lock(), vec!["rollback b", "rollback a"]);
}

#[test]
fn drop_under_open_cursor_is_deferred() {
    init_tracing();
    let engine = TestEngine::memory();
    let conn = Arc::clone(engine.conn());
    let store = engine.record_store("r1");

    let mut reader = engine.opctx();
    {
        let mut wuow = WriteUnitOfWork::new(&mut reader).unwrap();
        store.insert_record(&mut wuow, b"payload").unwrap();
        wuow.commit().unwrap();
    }
    let mut cursor = store.get_cursor(&mut reader, true).unwrap();
    assert!(cursor.next().unwrap().is_some());

    conn.drop_record_store("r1").unwrap();
    assert!(conn.have_drops_queued());
    assert!(conn.has_ident("r1").unwrap());

    drop(cursor);
    drop(reader);
    conn.retry_queued_drops().unwrap();
    assert!(!conn.have_drops_queued());
    assert!(!conn.has_ident("r1").unwrap());

    let mut opctx = engine.opctx();
    let gone = conn.get_record_store("r1", &Default::default());
    assert!(matches!(gone.num_records(&mut opctx), Err(CoreError::NotFound { .. })));
}

#[test]
fn queued_drop_waits_for_open_transaction() {
    let engine = TestEngine::memory();
    let conn = Arc::clone(engine.conn());
    let store = engine.record_store("r1");

    let mut writer = engine.opctx();
    let mut wuow = WriteUnitOfWork::new(&mut writer).unwrap();
    store.insert_record(&mut wuow, b"first").unwrap();

    conn.drop_record_store("r1").unwrap();
    assert!(conn.have_drops_queued());

    store.insert_record(&mut wuow, b"second").unwrap();
    assert_eq!(conn.retry_queued_drops().unwrap(), 0);
    assert!(conn.has_ident("r1").unwrap());
    wuow.commit().unwrap();

    drop(writer);
    assert_eq!(conn.retry_queued_drops().unwrap(), 1);
    assert!(!conn.have_drops_queued());
    assert!(!conn.has_ident("r1").unwrap());
}

#[test]
fn unique_index_duplicate_handling() {
    let engine = TestEngine::memory();
    let index = engine.index("idx1", true);
    let mut opctx = engine.opctx();
    let (l1, l2) = (RecordId::new(1), RecordId::new(2));
    let a = IndexKey::single("a");

    let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
    index.insert(&mut wuow, &a, l1, false).unwrap();
    let err = index.insert(&mut wuow, &a, l2, false).unwrap_err();
    assert!(err.is_duplicate_key());
    index.insert(&mut wuow, &a, l2, true).unwrap();
    wuow.commit().unwrap();

    let mut cursor = index.new_cursor(&mut opctx, true).unwrap();
    assert!(cursor.locate(&a, RecordId::min()).unwrap());
    let mut seen = Vec::new();
    while let Some(rid) = cursor.get_record_id() {
        seen.push(rid);
        cursor.advance().unwrap();
    }
    assert_eq!(seen, vec![l1, l2]);
}

#[test]
fn concurrent_unique_inserts_conflict() {
    let engine = TestEngine::memory();
    let index = engine.index("idx_conflict", true);
    let key = IndexKey::single("k");
    let mut first = engine.opctx();
    let mut second = engine.opctx();

    let mut w1 = WriteUnitOfWork::new(&mut first).unwrap();
    let mut w2 = WriteUnitOfWork::new(&mut second).unwrap();
    index.insert(&mut w1, &key, RecordId::new(1), false).unwrap();
    index.insert(&mut w2, &key, RecordId::new(2), false).unwrap();
    w1.commit().unwrap();
    assert!(w2.commit().unwrap_err().is_write_conflict());

    let mut opctx = engine.opctx();
    assert!(!index.is_dup(&mut opctx, &key, RecordId::new(1)).unwrap());
}

#[test]
fn heed_mutex_shields_writer_from_kill() {
    let engine = TestEngine::memory();
    let store = engine.record_store("r1");
    let mut opctx = engine.opctx();
    opctx.lock_global(LockMode::IntentExclusive, Duration::from_secs(1)).unwrap();

    let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
    store.insert_record(&mut wuow, b"x").unwrap();
    wuow.curop().kill();
    assert!(wuow.check_for_interrupt(true).is_ok());
    assert!(matches!(wuow.check_for_interrupt(false), Err(CoreError::Interrupted)));
    assert!(matches!(wuow.commit(), Err(CoreError::TransactionAborted { .. })));

    let mut reader = engine.opctx();
    assert_eq!(store.num_records(&mut reader).unwrap(), 0);
}

#[test]
fn time_limit_and_shutdown_interrupts() {
    let engine = TestEngine::memory();
    let mut opctx = engine.opctx();
    opctx.set_max_time(Duration::ZERO);
    std::thread::sleep(Duration::from_millis(2));
    assert!(matches!(opctx.check_for_interrupt(false), Err(CoreError::ExceededTimeLimit)));

    let mut other = engine.opctx();
    engine.process.registry().kill_all_operations();
    assert!(matches!(
        other.check_for_interrupt(false),
        Err(CoreError::InterruptedAtShutdown)
    ));
}

#[test]
fn size_storer_survives_restart() {
    init_tracing();
    let engine = TestEngine::file();
    {
        let store = engine.record_store("r1");
        let mut opctx = engine.opctx();
        let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
        for payload in [&b"abc"[..], b"defgh", b"ij"] {
            store.insert_record(&mut wuow, payload).unwrap();
        }
        wuow.commit().unwrap();
    }
    let dir = engine.path().unwrap();

    let engine = engine.reopen();
    assert!(has_checkpoint(&dir));
    let info = engine.conn().size_storer().get("table:r1").unwrap();
    assert_eq!((info.num_records, info.data_size), (3, 10));

    let store = engine.record_store("r1");
    let mut opctx = engine.opctx();
    assert_eq!(store.num_records(&mut opctx).unwrap(), 3);
    let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
    assert_eq!(store.insert_record(&mut wuow, b"k").unwrap(), RecordId::new(4));
    wuow.commit().unwrap();
}

#[test]
fn index_survives_restart() {
    let engine = TestEngine::file();
    {
        let index = engine.index("idx1", false);
        let mut opctx = engine.opctx();
        let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
        for (key, rid) in [("b", 2), ("a", 1), ("c", 3)] {
            index.insert(&mut wuow, &IndexKey::single(key), RecordId::new(rid), false).unwrap();
        }
        wuow.commit().unwrap();
    }

    let engine = engine.reopen();
    let index = engine.index("idx1", false);
    let mut opctx = engine.opctx();
    assert_eq!(index.full_validate(&mut opctx).unwrap(), 3);
    let mut cursor = index.new_cursor(&mut opctx, false).unwrap();
    assert!(cursor.locate(&IndexKey::single("c"), RecordId::max()).unwrap());
    assert_eq!(cursor.get_record_id(), Some(RecordId::new(3)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn nesting_commits_exactly_once(script in unit_of_work_script_strategy(24)) {
        let (engine, mut opctx) = counted_engine();
        opctx.process().connection().create_record_store("r1", &Default::default()).unwrap();
        let store = opctx.process().connection().get_record_store("r1", &Default::default());

        let mut depth = 0u32;
        let mut wrote = false;
        let mut doomed = false;
        for step in script {
            let before = engine.commit_seq();
            prop_assert_eq!(opctx.recovery_unit().depth(), depth);
            match step {
                UnitOfWorkStep::Begin => {
                    opctx.recovery_unit().begin_unit_of_work().unwrap();
                    depth += 1;
                }
                UnitOfWorkStep::Register => {
                    let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
                    store.insert_record(&mut wuow, b"x").unwrap();
                    wuow.commit().unwrap();
                    wrote = true;
                    prop_assert_eq!(engine.commit_seq(), before);
                }
                UnitOfWorkStep::Commit => {
                    let result = opctx.recovery_unit().commit_unit_of_work();
                    depth -= 1;
                    if depth > 0 {
                        result.unwrap();
                        prop_assert_eq!(engine.commit_seq(), before);
                    } else if doomed {
                        prop_assert!(result.is_err());
                        prop_assert_eq!(engine.commit_seq(), before);
                    } else {
                        result.unwrap();
                        prop_assert_eq!(engine.commit_seq(), before + u64::from(wrote));
                    }
                }
                UnitOfWorkStep::Abort => {
                    opctx.recovery_unit().end_unit_of_work();
                    depth -= 1;
                    doomed = true;
                    prop_assert_eq!(engine.commit_seq(), before);
                }
            }
            if depth == 0 {
                wrote = false;
                doomed = false;
            }
        }
        prop_assert_eq!(depth, 0);
    }
}
