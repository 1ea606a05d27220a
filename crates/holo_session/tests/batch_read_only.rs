mod common;

use anyhow::Result;
use holo_session::{
    BatchTransactionId, ParameterStore, Partition, PartitionOptions, SessionError,
};

use common::{connect, database, int, single_column, test_config};

const QUERY: &str = "SELECT pk FROM T";

fn options(max_partitions: u64) -> PartitionOptions {
    PartitionOptions {
        max_partitions: Some(max_partitions),
        ..PartitionOptions::default()
    }
}

#[test]
fn partitions_cover_every_row_once() -> Result<()> {
    let db = database();
    db.script_query(QUERY, single_column("pk", &[1, 2, 3, 4, 5]));
    let mut conn = connect(&db, test_config());
    conn.set_batch_read_only(true)?;

    let partitions = conn.partition_query(&options(2), QUERY, &ParameterStore::new())?;
    assert_eq!(partitions.len(), 2);

    let mut keys = Vec::new();
    for partition in &partitions {
        keys.extend(conn.execute_partition(partition)?.into_rows());
    }
    keys.sort_by_key(|row| format!("{row:?}"));
    assert_eq!(keys, (1..=5).map(|pk| vec![int(pk)]).collect::<Vec<_>>());
    assert_eq!(db.batch_transactions_opened(), 1);
    Ok(())
}

#[test]
fn partitions_run_on_a_connection_attached_by_id() -> Result<()> {
    let db = database();
    db.script_query(QUERY, single_column("pk", &[1, 2, 3, 4]));
    let mut coordinator = connect(&db, test_config());
    coordinator.set_batch_read_only(true)?;
    let partitions = coordinator.partition_query(&options(2), QUERY, &ParameterStore::new())?;

    // Ids and partitions travel as JSON between processes.
    let id_json = coordinator.batch_transaction_id()?.to_json()?;
    let partition_json = partitions[1].to_json()?;

    let mut worker = connect(&db, test_config());
    worker.set_batch_read_only(true)?;
    worker.open_batch_read_only_from_id(&BatchTransactionId::from_json(&id_json)?)?;
    let rows = worker.execute_partition(&Partition::from_json(&partition_json)?)?;
    assert_eq!(rows.into_rows(), vec![vec![int(2)], vec![int(4)]]);
    assert_eq!(db.batch_transactions_opened(), 2);
    Ok(())
}

#[test]
fn unknown_batch_id_is_rejected() -> Result<()> {
    let db = database();
    let mut conn = connect(&db, test_config());
    conn.set_batch_read_only(true)?;
    let id = BatchTransactionId {
        session_id: "memory/sessions/0".to_string(),
        transaction_id: vec![0xff; 8],
        read_timestamp: chrono::Utc::now(),
    };
    assert!(conn.open_batch_read_only_from_id(&id).is_err());
    Ok(())
}

#[test]
fn partition_operations_need_batch_mode() -> Result<()> {
    let db = database();
    db.script_query(QUERY, single_column("pk", &[1]));
    let mut conn = connect(&db, test_config());

    let err = conn
        .partition_query(&options(2), QUERY, &ParameterStore::new())
        .unwrap_err();
    assert!(matches!(err, SessionError::NotBatchReadOnly { .. }));
    assert!(matches!(
        conn.batch_transaction_id(),
        Err(SessionError::NotBatchReadOnly { .. })
    ));
    Ok(())
}

#[test]
fn batch_mode_rejects_mutations() -> Result<()> {
    let db = database();
    let mut conn = connect(&db, test_config());
    conn.set_batch_read_only(true)?;
    assert!(matches!(
        conn.write_mutations(vec![common::insert(1)]),
        Err(SessionError::ReadOnlyMutation)
    ));
    Ok(())
}
