//! PostgreSQL-backed checks for the vote table.
//!
//! These need a reachable database: `DATABASE_URL=postgres://... cargo test -p snapsync-storage -- --ignored`

use chrono::{TimeZone, Utc};
use snapsync_core::VoteRecord;
use snapsync_storage::{PgVoteStore, VoteStore};

fn vote(id: &str, created: i64) -> VoteRecord {
    VoteRecord {
        id: id.to_string(),
        voter: "0xd8da6bf26964af9d7eed9e03e53415d37aa96045".into(),
        choice: 2,
        created: Utc.timestamp_opt(created, 0).single().unwrap(),
        space_id: "uniswapgovernance.eth".into(),
        space_name: "uniswap".into(),
        space_avatar: "ipfs://uni".into(),
        space_admins: vec!["0xadmin".into()],
        space_moderators: vec!["0xmod1".into(), "0xmod2".into()],
        space_members: vec![],
        proposal_id: "0xproposal".into(),
        proposal_author: "0xauthor".into(),
        proposal_title: "Deploy Uniswap v3 on Linea".into(),
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn empty_table_has_no_latest_vote(pool: sqlx::PgPool) {
    let store = PgVoteStore::new(pool);
    assert!(store.latest_vote().await.unwrap().is_none());
    assert_eq!(store.count().await.unwrap(), 0);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn duplicate_batches_insert_once(pool: sqlx::PgPool) {
    let store = PgVoteStore::new(pool);
    let batch = vec![vote("0x01", 1001), vote("0x02", 1002)];

    assert_eq!(store.store(&batch).await.unwrap(), 2);
    assert_eq!(store.store(&batch).await.unwrap(), 0);
    assert_eq!(store.count().await.unwrap(), 2);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn conflicts_keep_the_original_row(pool: sqlx::PgPool) {
    let store = PgVoteStore::new(pool);
    store.store(&[vote("0x01", 1001)]).await.unwrap();

    let mut changed = vote("0x01", 9999);
    changed.choice = 7;
    let inserted = store.store(&[changed, vote("0x03", 1003)]).await.unwrap();
    assert_eq!(inserted, 1);

    let latest = store.latest_vote().await.unwrap().unwrap();
    assert_eq!(latest.id, "0x03");
    assert_eq!(store.count().await.unwrap(), 2);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn latest_vote_round_trips_list_columns(pool: sqlx::PgPool) {
    let store = PgVoteStore::new(pool);
    let expected = vote("0x09", 1_690_000_000);
    store.store(&[vote("0x08", 1_600_000_000), expected.clone()]).await.unwrap();

    let latest = store.latest_vote().await.unwrap().unwrap();
    assert_eq!(latest, expected);
}
