use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use slotd::tenant::TenantManager;
use slotd::wire;

// ── Test infrastructure ──────────────────────────────────────

const MONDAY: &str = "2026-10-19";

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotd".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("slotd")
        .password("slotd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Data rows of a simple query, each column as an owned string.
async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<Vec<Option<String>>> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(
                (0..row.len())
                    .map(|i| row.get(i).map(str::to_string))
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

async fn slot_starts(client: &tokio_postgres::Client, provider: Ulid, service: Ulid) -> Vec<String> {
    rows(
        client,
        &format!(
            "SELECT * FROM slots WHERE provider_id = '{provider}' AND service_id = '{service}' AND date = '{MONDAY}'"
        ),
    )
    .await
    .into_iter()
    .filter_map(|row| row[0].clone())
    .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

/// A provider working Mondays 09:00-17:00 with a lunch break, and a 60 minute service.
async fn setup(client: &tokio_postgres::Client) -> (Ulid, Ulid) {
    let provider = Ulid::new();
    let service = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO services (id, reference_minutes) VALUES ('{service}', 60)"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO schedules (provider_id, weekday, working, work_blocks, break_blocks) VALUES \
             ('{provider}', 1, true, '09:00-17:00', '12:00-13:00')"
        ))
        .await
        .unwrap();
    (provider, service)
}

async fn book(
    client: &tokio_postgres::Client,
    provider: Ulid,
    service: Ulid,
    start: &str,
) -> Result<Vec<Option<String>>, tokio_postgres::Error> {
    let id = Ulid::new();
    let client_id = Ulid::new();
    let msgs = client
        .simple_query(&format!(
            "INSERT INTO appointments (id, provider_id, service_id, client_id, date, start_time) VALUES \
             ('{id}', '{provider}', '{service}', '{client_id}', '{MONDAY}', '{start}')"
        ))
        .await?;
    Ok(msgs
        .into_iter()
        .find_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(
                (0..row.len())
                    .map(|i| row.get(i).map(str::to_string))
                    .collect(),
            ),
            _ => None,
        })
        .unwrap())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn slots_follow_schedule() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "slots").await;
    let (provider, service) = setup(&client).await;

    let starts = slot_starts(&client, provider, service).await;
    assert_eq!(starts.len(), 22);
    assert_eq!(starts.first().map(String::as_str), Some("09:00"));
    assert_eq!(starts.last().map(String::as_str), Some("16:00"));
    assert!(!starts.iter().any(|s| s == "11:15" || s == "12:00"));

    let schedule = rows(&client, &format!("SELECT * FROM schedules WHERE provider_id = '{provider}'")).await;
    assert_eq!(schedule.len(), 7);
    assert_eq!(schedule[1][1].as_deref(), Some("true"));
    assert_eq!(schedule[1][2].as_deref(), Some("09:00-17:00"));
    assert_eq!(schedule[1][3].as_deref(), Some("12:00-13:00"));
    assert_eq!(schedule[2][1].as_deref(), Some("false"));
}

#[tokio::test]
async fn schedule_insert_reports_rows_written() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "schedule_rows").await;
    let provider = Ulid::new();

    let written = client
        .execute(
            format!(
                "INSERT INTO schedules (provider_id, weekday, working, work_blocks) VALUES \
                 ('{provider}', 1, true, '09:00-12:00'), ('{provider}', 3, true, '13:00-17:00')"
            )
            .as_str(),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(written, 2);

    let err = client
        .simple_query(&format!(
            "INSERT INTO schedules (provider_id, weekday, working, work_blocks, lunch) VALUES \
             ('{provider}', 1, true, '09:00-12:00', '12:00-13:00')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));
}

#[tokio::test]
async fn booking_removes_overlapping_slots() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "booking").await;
    let (provider, service) = setup(&client).await;

    let receipt = book(&client, provider, service, "10:00").await.unwrap();
    assert_eq!(receipt[1].as_deref(), Some("pending"));
    assert_eq!(receipt[2].as_deref(), Some(MONDAY));
    assert_eq!(receipt[3].as_deref(), Some("10:00"));
    assert_eq!(receipt[4].as_deref(), Some("11:00"));
    let blocked: serde_json::Value = serde_json::from_str(receipt[5].as_deref().unwrap()).unwrap();
    assert!(blocked.is_array());

    let starts = slot_starts(&client, provider, service).await;
    assert!(starts.iter().any(|s| s == "09:00"));
    assert!(starts.iter().any(|s| s == "11:00"));
    for gone in ["09:15", "09:30", "10:00", "10:45"] {
        assert!(!starts.iter().any(|s| s == gone), "{gone} should be taken");
    }

    let listed = rows(
        &client,
        &format!("SELECT * FROM appointments WHERE provider_id = '{provider}' AND date = '{MONDAY}'"),
    )
    .await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0][0], receipt[0]);
}

#[tokio::test]
async fn conflicting_booking_is_exclusion_violation() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "conflict").await;
    let (provider, service) = setup(&client).await;

    book(&client, provider, service, "14:00").await.unwrap();
    let err = book(&client, provider, service, "14:30").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    let err = book(&client, provider, service, "18:00").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));
}

#[tokio::test]
async fn extended_protocol_booking() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "extended").await;
    let (provider, service) = setup(&client).await;

    let id = Ulid::new().to_string();
    let provider_s = provider.to_string();
    let service_s = service.to_string();
    let client_id = Ulid::new().to_string();
    let rows = client
        .query(
            "INSERT INTO appointments (id, provider_id, service_id, client_id, date, start_time, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[&id, &provider_s, &service_s, &client_id, &MONDAY, &"13:00", &"confirmed"],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<_, String>("id"), id);
    assert_eq!(rows[0].get::<_, String>("status"), "confirmed");
    assert_eq!(rows[0].get::<_, String>("end_time"), "14:00");

    let slots = client
        .query(
            "SELECT * FROM slots WHERE provider_id = $1 AND service_id = $2 AND date = $3",
            &[&provider_s, &service_s, &MONDAY],
        )
        .await
        .unwrap();
    let starts: Vec<String> = slots.iter().map(|r| r.get("start_time")).collect();
    assert!(!starts.iter().any(|s| s == "13:00"));
    assert!(starts.iter().any(|s| s == "14:00"));

    let found = client
        .query("SELECT * FROM appointments WHERE id = $1", &[&id])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get::<_, Option<String>>("cancel_reason"), None);

    let missing = client
        .query("SELECT * FROM appointments WHERE id = $1", &[&Ulid::new().to_string()])
        .await
        .unwrap();
    assert!(missing.is_empty());
}

#[tokio::test]
async fn lifecycle_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "lifecycle").await;
    let (provider, service) = setup(&client).await;

    let receipt = book(&client, provider, service, "15:00").await.unwrap();
    let id = receipt[0].clone().unwrap();

    let confirmed = rows(
        &client,
        &format!("INSERT INTO appointment_transitions (appointment_id, status) VALUES ('{id}', 'confirmed')"),
    )
    .await;
    assert_eq!(confirmed[0][7].as_deref(), Some("confirmed"));

    // cancelling needs a reason and an actor
    let err = client
        .simple_query(&format!(
            "INSERT INTO appointment_transitions (appointment_id, status) VALUES ('{id}', 'cancelled')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));

    let actor = Ulid::new();
    let canceled = rows(
        &client,
        &format!(
            "INSERT INTO appointment_transitions (appointment_id, status, reason, actor) VALUES \
             ('{id}', 'cancelled', 'provider ill', '{actor}')"
        ),
    )
    .await;
    assert_eq!(canceled[0][7].as_deref(), Some("canceled"));
    assert_eq!(canceled[0][9].as_deref(), Some("provider ill"));
    let actor_s = actor.to_string();
    assert_eq!(canceled[0][10].as_deref(), Some(actor_s.as_str()));
    assert!(canceled[0][11].is_some());

    // terminal
    let err = client
        .simple_query(&format!(
            "INSERT INTO appointment_transitions (appointment_id, status) VALUES ('{id}', 'confirmed')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("55000"));

    let starts = slot_starts(&client, provider, service).await;
    assert!(starts.iter().any(|s| s == "15:00"));
}

#[tokio::test]
async fn execution_time_override_and_restore() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "exec_time").await;
    let (provider, service) = setup(&client).await;

    client
        .batch_execute(&format!(
            "INSERT INTO execution_times (provider_id, service_id, minutes) VALUES ('{provider}', '{service}', 120)"
        ))
        .await
        .unwrap();
    let row = rows(
        &client,
        &format!("SELECT * FROM execution_times WHERE provider_id = '{provider}' AND service_id = '{service}'"),
    )
    .await;
    assert_eq!(row[0][2].as_deref(), Some("120"));
    assert_eq!(row[0][3].as_deref(), Some("true"));
    assert_eq!(row[0][4].as_deref(), Some("120"));

    let starts = slot_starts(&client, provider, service).await;
    assert_eq!(starts.last().map(String::as_str), Some("15:00"));
    assert!(!starts.iter().any(|s| s == "10:15"));

    client
        .batch_execute(&format!(
            "DELETE FROM execution_times WHERE provider_id = '{provider}' AND service_id = '{service}'"
        ))
        .await
        .unwrap();
    let row = rows(
        &client,
        &format!("SELECT * FROM execution_times WHERE provider_id = '{provider}' AND service_id = '{service}'"),
    )
    .await;
    assert_eq!(row[0][3].as_deref(), Some("false"));
    assert_eq!(row[0][4].as_deref(), Some("60"));

    let starts = slot_starts(&client, provider, service).await;
    assert_eq!(starts.len(), 22);
}

#[tokio::test]
async fn service_config_round_trips() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "service_config").await;
    let (provider, service) = setup(&client).await;

    client
        .batch_execute(&format!(
            "INSERT INTO service_configs (provider_id, service_id, restrict_to_time_ranges, time_ranges) VALUES \
             ('{provider}', '{service}', true, '14:00-16:00')"
        ))
        .await
        .unwrap();

    let config = rows(
        &client,
        &format!("SELECT * FROM service_configs WHERE provider_id = '{provider}' AND service_id = '{service}'"),
    )
    .await;
    assert_eq!(config[0][2].as_deref(), Some("true"));
    assert_eq!(config[0][3].as_deref(), Some("14:00-16:00"));

    let starts = slot_starts(&client, provider, service).await;
    assert_eq!(starts, vec!["14:00", "14:15", "14:30", "14:45", "15:00"]);
}

#[tokio::test]
async fn databases_are_isolated() {
    let (addr, tm) = start_test_server().await;
    let a = connect(addr, "clinic_a").await;
    let b = connect(addr, "clinic_b").await;
    let (provider, service) = setup(&a).await;

    assert_eq!(slot_starts(&a, provider, service).await.len(), 22);
    let err = b
        .simple_query(&format!(
            "SELECT * FROM slots WHERE provider_id = '{provider}' AND service_id = '{service}' AND date = '{MONDAY}'"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));
    assert_eq!(tm.tenant_count(), 2);
}

#[tokio::test]
async fn malformed_sql_is_syntax_error() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "malformed").await;

    let err = client.simple_query("SELECT * FROM nowhere").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    let err = client.simple_query("not sql at all").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));
}
