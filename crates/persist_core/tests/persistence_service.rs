mod common;

use common::{
    stored_order, Order, OrderLine, LINE_SCHEMA, LINE_SEQUENCE, ORDER_SCHEMA, ORDER_SEQUENCE,
};
use persist_core::config::PersistConfig;
use persist_core::model::entity::{EntityState, Stateful};
use persist_core::model::record::Entity;
use persist_core::model::sequence::SequenceRow;
use persist_core::model::value::FieldValue;
use persist_core::repo::{Filter, FindQuery, GetQuery, RepositorySession, SqliteSessionFactory};
use persist_core::sequence::{SequenceAllocator, SqliteSequenceStore};
use persist_core::service::{parse_json, PersistenceService, ServiceError};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

type Service = PersistenceService<SqliteSessionFactory, SqliteSequenceStore>;

fn bare_service() -> Service {
    let sessions = SqliteSessionFactory::memory().unwrap();
    let store = SqliteSequenceStore::new(sessions.clone(), &PersistConfig::default());
    let service = PersistenceService::new(sessions, Arc::new(SequenceAllocator::new(store)));
    service.sync(&[&ORDER_SCHEMA, &LINE_SCHEMA]).unwrap();
    service
}

fn service() -> Service {
    let service = bare_service();
    service.register_sequence(ORDER_SEQUENCE, 500).unwrap();
    service.register_sequence(LINE_SEQUENCE, 500).unwrap();
    service
}

fn order_count(service: &Service) -> u64 {
    service.count(&Order::default(), None).unwrap()
}

fn load_order(service: &Service, id: u64) -> Option<Order> {
    let mut order = stored_order(id, "", 0);
    service
        .get(&mut order, &GetQuery::default())
        .unwrap()
        .then_some(order)
}

#[test]
fn save_new_entity_assigns_allocator_id_and_persists_it() {
    let service = service();
    let mut order = Order::new("A-1", 10);

    let affected = service.save(&mut [&mut order]).unwrap();

    assert_eq!(affected, 1);
    assert_eq!(order.id, 1);
    assert_eq!(order.state(), EntityState::None);
    let stored = load_order(&service, order.id).unwrap();
    assert_eq!(stored.code, "A-1");
    assert_eq!(stored.amount, 10);
}

#[test]
fn failing_record_rolls_back_the_whole_batch() {
    let service = service();
    let mut first = Order::new("DUP", 1);
    let mut second = Order::new("DUP", 2);

    let err = service.save(&mut [&mut first, &mut second]).unwrap_err();

    assert!(matches!(err, ServiceError::Store(_)));
    assert_eq!(order_count(&service), 0);
    assert_eq!(first.id, 0);
    assert_eq!(second.id, 0);
    assert_eq!(first.state(), EntityState::New);
    assert_eq!(second.state(), EntityState::New);
}

#[test]
fn modified_entity_is_fully_updated() {
    let service = service();
    let mut order = Order::new("A-1", 10);
    service.save(&mut [&mut order]).unwrap();

    order.amount = 0;
    order.note = Some("discounted".to_string());
    order.set_state(EntityState::Modified);
    assert_eq!(service.save(&mut [&mut order]).unwrap(), 1);

    let stored = load_order(&service, order.id).unwrap();
    assert_eq!(stored.amount, 0);
    assert_eq!(stored.note.as_deref(), Some("discounted"));
    assert_eq!(order.state(), EntityState::None);
}

#[test]
fn new_entity_marked_modified_is_still_inserted() {
    let service = service();
    let mut order = Order::new("A-1", 10);
    order.set_state(EntityState::Modified);
    assert_eq!(order.state(), EntityState::New);

    assert_eq!(service.save(&mut [&mut order]).unwrap(), 1);
    assert!(load_order(&service, order.id).is_some());
}

#[test]
fn deleted_entity_is_removed_and_stays_deleted() {
    let service = service();
    let mut order = Order::new("A-1", 10);
    service.save(&mut [&mut order]).unwrap();

    order.set_state(EntityState::Deleted);
    assert_eq!(service.save(&mut [&mut order]).unwrap(), 1);

    assert_eq!(order_count(&service), 0);
    assert_eq!(order.state(), EntityState::Deleted);
}

#[test]
fn deleted_entity_without_id_deletes_by_its_fields() {
    let service = service();
    let mut a = Order::new("A-1", 10);
    let mut b = Order::new("A-2", 10);
    let mut c = Order::new("B-1", 30);
    service.insert(&mut [&mut a, &mut b, &mut c]).unwrap();

    let mut doomed = Order {
        amount: 10,
        ..Order::default()
    };
    doomed.force_state(EntityState::Deleted);
    assert_eq!(service.save(&mut [&mut doomed]).unwrap(), 2);

    assert_eq!(order_count(&service), 1);
    assert!(load_order(&service, c.id).is_some());
}

#[test]
fn clean_entities_are_skipped() {
    let service = service();
    let mut order = stored_order(42, "A-1", 10);
    assert_eq!(service.save(&mut [&mut order]).unwrap(), 0);
    assert_eq!(order_count(&service), 0);
}

#[test]
fn save_accepts_mixed_entity_types() {
    let service = service();
    let mut order = Order::new("A-1", 10);
    let mut line = OrderLine::new("SKU-1", 3);
    line.order_id = 1;

    let records: &mut [&mut dyn Entity] = &mut [&mut order, &mut line];
    assert_eq!(service.save(records).unwrap(), 2);

    assert_eq!(order.id, 1);
    assert_eq!(line.id, 1);
    let lines: Vec<OrderLine> = service.find(None, &FindQuery::default()).unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].sku, "SKU-1");
}

#[test]
fn upsert_inserts_unsaved_and_updates_saved_records() {
    let service = service();
    let mut existing = Order::new("A-1", 10);
    service.insert(&mut [&mut existing]).unwrap();

    existing.amount = 15;
    let mut fresh = Order::new("A-2", 20);
    assert_eq!(service.upsert(&mut [&mut existing, &mut fresh]).unwrap(), 2);

    assert_eq!(fresh.id, 2);
    assert_eq!(load_order(&service, existing.id).unwrap().amount, 15);
    assert_eq!(order_count(&service), 2);
}

#[test]
fn insert_assigns_ascending_ids_per_sequence() {
    let service = service();
    let mut a = Order::new("A-1", 1);
    let mut b = Order::new("A-2", 2);
    let mut kept = stored_order(900, "A-3", 3);

    assert_eq!(service.insert(&mut [&mut a, &mut kept, &mut b]).unwrap(), 3);

    assert_eq!((a.id, b.id, kept.id), (1, 2, 900));
}

#[test]
fn batch_insert_spans_chunks() {
    let service = service();
    let mut lines: Vec<OrderLine> = (0..1_205)
        .map(|index| OrderLine::new(&format!("SKU-{index}"), 1))
        .collect();
    let mut refs: Vec<&mut OrderLine> = lines.iter_mut().collect();

    assert_eq!(service.batch_insert(&mut refs).unwrap(), 1_205);

    assert_eq!(service.count(&OrderLine::default(), None).unwrap(), 1_205);
    let ids: Vec<u64> = lines.iter().map(|line| line.id).collect();
    let unique: HashSet<u64> = ids.iter().copied().collect();
    assert_eq!(unique.len(), 1_205);
    assert_eq!(ids.first(), Some(&1));
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(ids[999] < ids[1_000]);
}

#[test]
fn json_payloads_become_savable_orders() {
    let service = service();
    let mut orders: Vec<Order> =
        parse_json(br#"[{"code":"J-1","amount":4},{"code":"J-2","note":"gift"}]"#).unwrap();
    let mut single: Vec<Order> = parse_json(br#"{"code":"J-3","amount":9}"#).unwrap();
    assert_eq!(orders.len(), 2);
    assert_eq!(single.len(), 1);
    orders.append(&mut single);

    for order in &mut orders {
        order.force_state(EntityState::New);
    }
    let mut refs: Vec<&mut Order> = orders.iter_mut().collect();
    assert_eq!(service.save(&mut refs).unwrap(), 3);

    let ids: Vec<u64> = orders.iter().map(|order| order.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(load_order(&service, 2).unwrap().note.as_deref(), Some("gift"));
}

#[test]
fn empty_batches_are_a_no_op() {
    let service = service();
    let mut none: [&mut Order; 0] = [];
    assert_eq!(service.save(&mut none).unwrap(), 0);
    assert_eq!(service.insert(&mut none).unwrap(), 0);
    assert_eq!(service.upsert(&mut none).unwrap(), 0);
    assert_eq!(service.batch_insert(&mut none).unwrap(), 0);
}

#[test]
fn records_without_id_or_sequence_are_rejected() {
    let service = service();
    let mut row = SequenceRow::default();
    assert!(matches!(
        service.insert(&mut [&mut row]),
        Err(ServiceError::Validation(_))
    ));
}

#[test]
fn unregistered_sequence_is_a_validation_error() {
    let service = bare_service();
    let mut order = Order::new("A-1", 10);

    let err = service.save(&mut [&mut order]).unwrap_err();

    assert!(matches!(err, ServiceError::Validation(_)));
    assert_eq!(order.id, 0);
    assert_eq!(order_count(&service), 0);
}

#[test]
fn update_and_delete_pass_columns_and_filters_through() {
    let service = service();
    let mut a = Order::new("A-1", 10);
    let mut b = Order::new("B-1", 20);
    service.insert(&mut [&mut a, &mut b]).unwrap();

    a.amount = 11;
    a.code = "ignored".to_string();
    assert_eq!(service.update(&a, &["amount"], None).unwrap(), 1);
    assert_eq!(load_order(&service, a.id).unwrap().code, "A-1");

    let filter = Filter::new("amount > ?", vec![FieldValue::Integer(15)]);
    assert_eq!(service.delete(&Order::default(), Some(&filter)).unwrap(), 1);
    assert_eq!(order_count(&service), 1);
}

#[test]
fn exec_query_and_id_helpers() {
    let service = service();
    let ids = service.next_ids(ORDER_SEQUENCE, 3).unwrap();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(service.next_id(ORDER_SEQUENCE).unwrap(), 4);
    assert!(matches!(
        service.next_ids(ORDER_SEQUENCE, 0),
        Err(ServiceError::Validation(_))
    ));

    let result = service
        .exec(
            "INSERT INTO orders (id, code, amount) VALUES (?, ?, ?);",
            &[FieldValue::Unsigned(4), FieldValue::from("RAW"), FieldValue::Integer(5)],
        )
        .unwrap();
    assert_eq!(result.rows_affected, 1);

    let rows = service
        .query("SELECT code FROM orders WHERE id = ?;", &[FieldValue::Unsigned(4)])
        .unwrap();
    assert_eq!(rows[0].get_str("code"), Some("RAW"));
}

#[test]
fn service_transaction_rolls_back_on_panic() {
    let service = service();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = service.transaction(|session| -> persist_core::repo::RepoResult<()> {
            session.insert(&[&stored_order(1, "A-1", 10)])?;
            panic!("unexpected state");
        });
    }));

    assert!(outcome.is_err());
    assert_eq!(order_count(&service), 0);
}

#[test]
fn service_transaction_commits_multi_step_work() {
    let service = service();

    let total = service
        .transaction(|session| {
            session.insert(&[&stored_order(1, "A-1", 10)])?;
            session.insert(&[&stored_order(2, "A-2", 20)])?;
            session.count(&Order::default(), None)
        })
        .unwrap();

    assert_eq!(total, 2);
    assert_eq!(order_count(&service), 2);
}
