//! Engine-level tests for the join-request workflow: exactly-once consumption
//! of pending requests under concurrent owner actions, and session tracking.

use codeshare_server::db::{self, DbPool};
use codeshare_server::error::ApiError;
use codeshare_server::rooms::access;

fn open_test_db() -> (DbPool, tempfile::TempDir) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db = db::init_db(tmp_dir.path().to_str().unwrap()).expect("Failed to init DB");
    (db, tmp_dir)
}

fn insert_user(db: &DbPool, id: &str, username: &str) {
    let conn = db.lock().unwrap();
    conn.execute(
        "INSERT INTO users (id, username, password_hash, is_online, created_at, updated_at)
         VALUES (?1, ?2, 'x', 0, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
        rusqlite::params![id, username],
    )
    .unwrap();
}

fn insert_room(db: &DbPool, id: &str, owner_id: &str, room_type: &str) {
    let conn = db.lock().unwrap();
    conn.execute(
        "INSERT INTO rooms (id, name, description, language, owner_id, room_type,
                            code, is_active, created_at, updated_at)
         VALUES (?1, 'test room', NULL, 'javascript', ?2, ?3, '', 1,
                 '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
        rusqlite::params![id, owner_id, room_type],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO room_participants (room_id, user_id, joined_at)
         VALUES (?1, ?2, '2026-01-01T00:00:00Z')",
        rusqlite::params![id, owner_id],
    )
    .unwrap();
}

fn count_rows(db: &DbPool, sql: &str, params: &[&str]) -> i64 {
    let conn = db.lock().unwrap();
    conn.query_row(sql, rusqlite::params_from_iter(params.iter()), |row| {
        row.get(0)
    })
    .unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_concurrent_approve_and_reject_resolve_exactly_once() {
    let (db, _tmp) = open_test_db();
    insert_user(&db, "owner", "owner");
    insert_user(&db, "req", "requester");
    insert_room(&db, "room1", "owner", "request_to_join");

    access::request_join(db.clone(), "room1".into(), "req".into(), "requester".into())
        .await
        .unwrap();

    let (approve_res, reject_res) = tokio::join!(
        access::approve(db.clone(), "room1".into(), "owner".into(), "req".into()),
        access::reject(db.clone(), "room1".into(), "owner".into(), "req".into()),
    );

    // Exactly one of the two consumed the request; the other saw Conflict.
    let approved = approve_res.is_ok();
    let rejected = reject_res.is_ok();
    assert!(
        approved != rejected,
        "Expected exactly one winner, got approve={:?} reject={:?}",
        approve_res.as_ref().map(|_| ()),
        reject_res
    );
    match (&approve_res, &reject_res) {
        (Err(e), _) | (_, Err(e)) => assert!(matches!(e, ApiError::Conflict(_))),
        _ => unreachable!(),
    }

    // The pending entry is gone either way.
    let pending = count_rows(
        &db,
        "SELECT COUNT(*) FROM join_requests WHERE room_id = ?1",
        &["room1"],
    );
    assert_eq!(pending, 0);

    // Membership reflects the winner, not the loser.
    let member = count_rows(
        &db,
        "SELECT COUNT(*) FROM room_participants WHERE room_id = ?1 AND user_id = ?2",
        &["room1", "req"],
    );
    assert_eq!(member, if approved { 1 } else { 0 });
}

#[tokio::test]
async fn test_concurrent_duplicate_requests_enqueue_once() {
    let (db, _tmp) = open_test_db();
    insert_user(&db, "owner", "owner");
    insert_user(&db, "req", "requester");
    insert_room(&db, "room1", "owner", "request_to_join");

    let (a, b) = tokio::join!(
        access::request_join(db.clone(), "room1".into(), "req".into(), "requester".into()),
        access::request_join(db.clone(), "room1".into(), "req".into(), "requester".into()),
    );

    assert!(
        a.is_ok() != b.is_ok(),
        "Expected exactly one request to land"
    );
    let loser = if a.is_err() { a } else { b };
    assert!(matches!(loser, Err(ApiError::Conflict(_))));

    let pending = count_rows(
        &db,
        "SELECT COUNT(*) FROM join_requests WHERE room_id = ?1 AND user_id = ?2",
        &["room1", "req"],
    );
    assert_eq!(pending, 1);
}

#[tokio::test]
async fn test_request_join_rejected_for_non_gated_rooms() {
    let (db, _tmp) = open_test_db();
    insert_user(&db, "owner", "owner");
    insert_user(&db, "req", "requester");
    insert_room(&db, "pub", "owner", "public");
    insert_room(&db, "priv", "owner", "private");

    let res = access::request_join(db.clone(), "pub".into(), "req".into(), "requester".into()).await;
    assert!(matches!(res, Err(ApiError::Forbidden(_))));

    let res =
        access::request_join(db.clone(), "priv".into(), "req".into(), "requester".into()).await;
    assert!(matches!(res, Err(ApiError::Forbidden(_))));
}

#[tokio::test]
async fn test_participant_request_is_conflict() {
    let (db, _tmp) = open_test_db();
    insert_user(&db, "owner", "owner");
    insert_user(&db, "member", "member");
    insert_room(&db, "room1", "owner", "request_to_join");

    {
        let conn = db.lock().unwrap();
        conn.execute(
            "INSERT INTO room_participants (room_id, user_id, joined_at)
             VALUES ('room1', 'member', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
    }

    let res =
        access::request_join(db.clone(), "room1".into(), "member".into(), "member".into()).await;
    assert!(matches!(res, Err(ApiError::Conflict(_))));
}

#[tokio::test]
async fn test_approve_is_idempotent_on_membership() {
    let (db, _tmp) = open_test_db();
    insert_user(&db, "owner", "owner");
    insert_user(&db, "req", "requester");
    insert_room(&db, "room1", "owner", "request_to_join");

    access::request_join(db.clone(), "room1".into(), "req".into(), "requester".into())
        .await
        .unwrap();
    let snapshot = access::approve(db.clone(), "room1".into(), "owner".into(), "req".into())
        .await
        .unwrap();
    assert!(snapshot.participants.iter().any(|p| p.user_id == "req"));

    // Re-requesting after membership is a Conflict, not a second enqueue.
    let res =
        access::request_join(db.clone(), "room1".into(), "req".into(), "requester".into()).await;
    assert!(matches!(res, Err(ApiError::Conflict(_))));

    let member = count_rows(
        &db,
        "SELECT COUNT(*) FROM room_participants WHERE room_id = ?1 AND user_id = ?2",
        &["room1", "req"],
    );
    assert_eq!(member, 1);
}

#[tokio::test]
async fn test_cancel_versus_approve_exactly_once() {
    let (db, _tmp) = open_test_db();
    insert_user(&db, "owner", "owner");
    insert_user(&db, "req", "requester");
    insert_room(&db, "room1", "owner", "request_to_join");

    access::request_join(db.clone(), "room1".into(), "req".into(), "requester".into())
        .await
        .unwrap();

    let (cancel_res, approve_res) = tokio::join!(
        access::cancel(db.clone(), "room1".into(), "req".into()),
        access::approve(db.clone(), "room1".into(), "owner".into(), "req".into()),
    );

    assert!(
        cancel_res.is_ok() != approve_res.is_ok(),
        "Expected exactly one winner"
    );
    let pending = count_rows(
        &db,
        "SELECT COUNT(*) FROM join_requests WHERE room_id = ?1",
        &["room1"],
    );
    assert_eq!(pending, 0);
}

#[tokio::test]
async fn test_session_reopened_join_keeps_single_active_row() {
    let (db, _tmp) = open_test_db();
    insert_user(&db, "owner", "owner");
    insert_user(&db, "u1", "user1");
    insert_room(&db, "room1", "owner", "public");

    // join, leave, join again
    access::join(db.clone(), "room1".into(), "u1".into(), false)
        .await
        .unwrap();
    access::leave(db.clone(), "room1".into(), "u1".into())
        .await
        .unwrap();
    access::join(db.clone(), "room1".into(), "u1".into(), false)
        .await
        .unwrap();
    // repeat join while already active upserts instead of inserting
    access::join(db.clone(), "room1".into(), "u1".into(), false)
        .await
        .unwrap();

    let active = count_rows(
        &db,
        "SELECT COUNT(*) FROM sessions WHERE user_id = ?1 AND room_id = ?2 AND is_active = 1",
        &["u1", "room1"],
    );
    assert_eq!(active, 1, "Expected a single active session row");

    let closed = count_rows(
        &db,
        "SELECT COUNT(*) FROM sessions WHERE user_id = ?1 AND room_id = ?2 AND is_active = 0",
        &["u1", "room1"],
    );
    assert_eq!(closed, 1, "Expected the first session to be closed out");
}

#[tokio::test]
async fn test_leave_clears_membership_and_cursor() {
    let (db, _tmp) = open_test_db();
    insert_user(&db, "owner", "owner");
    insert_user(&db, "u1", "user1");
    insert_room(&db, "room1", "owner", "public");

    access::join(db.clone(), "room1".into(), "u1".into(), false)
        .await
        .unwrap();
    access::update_cursor(
        db.clone(),
        "room1".into(),
        codeshare_server::db::models::Cursor {
            user_id: "u1".into(),
            username: "user1".into(),
            line: 3,
            ch: 14,
            color: "#ff8800".into(),
        },
    )
    .await
    .unwrap();

    access::leave(db.clone(), "room1".into(), "u1".into())
        .await
        .unwrap();

    let member = count_rows(
        &db,
        "SELECT COUNT(*) FROM room_participants WHERE room_id = ?1 AND user_id = ?2",
        &["room1", "u1"],
    );
    assert_eq!(member, 0);
    let cursors = count_rows(
        &db,
        "SELECT COUNT(*) FROM room_cursors WHERE room_id = ?1 AND user_id = ?2",
        &["room1", "u1"],
    );
    assert_eq!(cursors, 0);
}

#[tokio::test]
async fn test_cursor_update_requires_membership() {
    let (db, _tmp) = open_test_db();
    insert_user(&db, "owner", "owner");
    insert_user(&db, "outsider", "outsider");
    insert_room(&db, "room1", "owner", "public");

    let res = access::update_cursor(
        db.clone(),
        "room1".into(),
        codeshare_server::db::models::Cursor {
            user_id: "outsider".into(),
            username: "outsider".into(),
            line: 0,
            ch: 0,
            color: "#000000".into(),
        },
    )
    .await;
    assert!(matches!(res, Err(ApiError::Forbidden(_))));
}

#[tokio::test]
async fn test_join_after_room_opened_consumes_pending_entry() {
    let (db, _tmp) = open_test_db();
    insert_user(&db, "owner", "owner");
    insert_user(&db, "u1", "user1");
    insert_room(&db, "room1", "owner", "request_to_join");

    access::request_join(db.clone(), "room1".into(), "u1".into(), "user1".into())
        .await
        .unwrap();

    // Owner relaxes the room type while the request is still pending.
    {
        let conn = db.lock().unwrap();
        conn.execute(
            "UPDATE rooms SET room_type = 'public' WHERE id = 'room1'",
            [],
        )
        .unwrap();
    }

    let outcome = access::join(db.clone(), "room1".into(), "u1".into(), false)
        .await
        .unwrap();
    assert!(matches!(outcome, access::JoinOutcome::Joined(_)));

    // Membership and a pending entry are mutually exclusive: the join must
    // have consumed the leftover request.
    let member = count_rows(
        &db,
        "SELECT COUNT(*) FROM room_participants WHERE room_id = ?1 AND user_id = ?2",
        &["room1", "u1"],
    );
    assert_eq!(member, 1);
    let pending = count_rows(
        &db,
        "SELECT COUNT(*) FROM join_requests WHERE room_id = ?1 AND user_id = ?2",
        &["room1", "u1"],
    );
    assert_eq!(pending, 0);
}

#[tokio::test]
async fn test_gated_join_via_code_still_pends() {
    let (db, _tmp) = open_test_db();
    insert_user(&db, "owner", "owner");
    insert_user(&db, "u1", "user1");
    insert_room(&db, "room1", "owner", "request_to_join");

    // Holding a code is not a pass for gated rooms.
    let outcome = access::join(db.clone(), "room1".into(), "u1".into(), true)
        .await
        .unwrap();
    assert!(matches!(outcome, access::JoinOutcome::AwaitingApproval));
    let member = count_rows(
        &db,
        "SELECT COUNT(*) FROM room_participants WHERE room_id = ?1 AND user_id = ?2",
        &["room1", "u1"],
    );
    assert_eq!(member, 0);
}
