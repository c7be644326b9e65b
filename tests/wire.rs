use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use slotd::config;
use slotd::tenant::TenantManager;
use slotd::wire;

// ── Test infrastructure ──────────────────────────────────────

const API_KEY: &str = "slotd";

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(&config::Config {
        data_dir: dir,
        ..config::Config::default()
    }));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, API_KEY.to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

fn client_config(addr: SocketAddr, user: &str, password: &str) -> Config {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user(user)
        .password(password);
    config
}

async fn connect_as(addr: SocketAddr, user: &str) -> Client {
    let (client, connection) = client_config(addr, user, API_KEY).connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn connect(addr: SocketAddr) -> Client {
    connect_as(addr, "slotd").await
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.err().unwrap();
    err.code().unwrap().code().to_string()
}

/// A user working 09:00 to 17:00 UTC on weekdays, with a 30 minute event type.
struct Host {
    user_id: Ulid,
    event_type_id: Ulid,
}

async fn seed_host(client: &Client, username: &str) -> Host {
    let user_id = Ulid::new();
    let schedule_id = Ulid::new();
    let event_type_id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, username) VALUES ('{user_id}', '{username}')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            r#"INSERT INTO schedules (id, user_id, name, time_zone, availability)
               VALUES ('{schedule_id}', '{user_id}', 'Working hours', 'UTC',
                       '[{{"days": ["Mon", "Tue", "Wed", "Thu", "Fri"], "start": "09:00", "end": "17:00"}}]')"#
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "UPDATE users SET default_schedule_id = '{schedule_id}' WHERE id = '{user_id}'"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO event_types (id, slug, user_id, length) VALUES ('{event_type_id}', 'intro', '{user_id}', 30)"
        ))
        .await
        .unwrap();
    Host {
        user_id,
        event_type_id,
    }
}

/// Monday 2030-01-07, the whole UTC day, as start/end ranges.
fn monday_slots_sql(event_type_id: Ulid) -> String {
    format!(
        r#"SELECT * FROM slots WHERE event_type_id = '{event_type_id}'
           AND start >= '2030-01-07T00:00:00Z' AND "end" <= '2030-01-07T23:59:59Z'
           AND format = 'range'"#
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn directory_round_trip() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let host = seed_host(&client, "ada").await;

    let users = rows(&client, &format!("SELECT * FROM users WHERE id = '{}'", host.user_id)).await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].get("username"), Some("ada"));
    assert!(users[0].get("default_schedule_id").is_some());

    let event_types = rows(&client, "SELECT * FROM event_types WHERE username = 'ada' AND slug = 'intro'").await;
    assert_eq!(event_types.len(), 1);
    assert_eq!(event_types[0].get("length"), Some("30"));
    assert_eq!(event_types[0].get("period"), Some("unlimited"));
    assert_eq!(event_types[0].get("scheduling_type"), Some("round_robin"));

    client
        .batch_execute(&format!(
            "UPDATE event_types SET length = 45, multiple_duration = '[30, 45]' WHERE id = '{}'",
            host.event_type_id
        ))
        .await
        .unwrap();
    let updated = rows(&client, &format!("SELECT * FROM event_types WHERE id = '{}'", host.event_type_id)).await;
    assert_eq!(updated[0].get("length"), Some("45"));
    assert_eq!(updated[0].get("multiple_duration"), Some("[30,45]"));
}

#[tokio::test]
async fn slots_for_a_working_day() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let host = seed_host(&client, "grace").await;

    let slots = rows(&client, &monday_slots_sql(host.event_type_id)).await;
    assert_eq!(slots.len(), 16);
    assert_eq!(slots[0].get("date"), Some("2030-01-07"));
    assert_eq!(slots[0].get("start"), Some("2030-01-07T09:00:00Z"));
    assert_eq!(slots[0].get("end"), Some("2030-01-07T09:30:00Z"));
    assert_eq!(slots[15].get("start"), Some("2030-01-07T16:30:00Z"));
    assert_eq!(slots[0].get("seats_total"), None);

    // Same grid through the owner's username and slug, rendered in another zone.
    let by_slug = rows(
        &client,
        r#"SELECT * FROM slots WHERE username = 'grace' AND event_type_slug = 'intro'
           AND start >= '2030-01-07T00:00:00Z' AND "end" <= '2030-01-07T23:59:59Z'
           AND time_zone = 'Europe/Berlin' AND format = 'time'"#,
    )
    .await;
    assert_eq!(by_slug.len(), 16);
    assert_eq!(by_slug[0].get("start"), Some("2030-01-07T10:00:00+01:00"));
    assert_eq!(by_slug[0].get("end"), None);
}

#[tokio::test]
async fn reserve_then_book() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let host = seed_host(&client, "linus").await;

    let held = rows(
        &client,
        &format!(
            "INSERT INTO reservations (event_type_id, slot_start) VALUES ('{}', '2030-01-07T09:00:00Z')",
            host.event_type_id
        ),
    )
    .await;
    assert_eq!(held.len(), 1);
    let uid = held[0].get("uid").unwrap().to_string();
    assert_eq!(held[0].get("reservation_duration"), Some("5"));
    assert_eq!(held[0].get("host_ids"), Some(format!("[\"{}\"]", host.user_id).as_str()));

    // The hold hides the slot from everyone else.
    let slots = rows(&client, &monday_slots_sql(host.event_type_id)).await;
    assert_eq!(slots.len(), 15);
    assert_eq!(slots[0].get("start"), Some("2030-01-07T09:30:00Z"));

    let booked = rows(
        &client,
        &format!(
            "INSERT INTO bookings (event_type_id, start, reservation_uid) VALUES ('{}', '2030-01-07T09:00:00Z', '{uid}')",
            host.event_type_id
        ),
    )
    .await;
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("status"), Some("accepted"));
    let booking_id = booked[0].get("id").unwrap().to_string();

    // The hold was consumed by the booking.
    assert_eq!(
        sqlstate(&client, &format!("SELECT * FROM reservations WHERE uid = '{uid}'")).await,
        "P0002"
    );

    // A second booking at the same start conflicts.
    assert_eq!(
        sqlstate(
            &client,
            &format!(
                "INSERT INTO bookings (event_type_id, start) VALUES ('{}', '2030-01-07T09:00:00Z')",
                host.event_type_id
            ),
        )
        .await,
        "23P01"
    );

    let moved = rows(
        &client,
        &format!("UPDATE bookings SET start = '2030-01-07T11:00:00Z' WHERE id = '{booking_id}'"),
    )
    .await;
    assert_eq!(moved[0].get("start"), Some("2030-01-07T11:00:00Z"));

    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{booking_id}'"))
        .await
        .unwrap();
    let cancelled = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{booking_id}'")).await;
    assert_eq!(cancelled[0].get("status"), Some("cancelled"));
    assert_eq!(rows(&client, &monday_slots_sql(host.event_type_id)).await.len(), 16);
}

#[tokio::test]
async fn custom_hold_duration_needs_a_permitted_login() {
    let (addr, _tm) = start_test_server().await;
    let anonymous = connect(addr).await;
    let host = seed_host(&anonymous, "barbara").await;

    let insert = format!(
        "INSERT INTO reservations (event_type_id, slot_start, reservation_duration) VALUES ('{}', '2030-01-07T10:00:00Z', 15)",
        host.event_type_id
    );
    assert_eq!(sqlstate(&anonymous, &insert).await, "42501");

    let owner = connect_as(addr, &host.user_id.to_string()).await;
    let held = rows(&owner, &insert).await;
    assert_eq!(held[0].get("reservation_duration"), Some("15"));
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let host = seed_host(&client, "edsger").await;

    assert_eq!(sqlstate(&client, "SELECT * FROM calendars").await, "42P01");
    assert_eq!(sqlstate(&client, "SELECT * FROM slots").await, "42601");
    assert_eq!(sqlstate(&client, "NOT EVEN SQL").await, "42601");
    assert_eq!(
        sqlstate(&client, &format!("INSERT INTO users (id, username, color) VALUES ('{}', 'x', 'red')", Ulid::new())).await,
        "42703"
    );
    assert_eq!(
        sqlstate(&client, &format!("INSERT INTO users (id, username) VALUES ('{}', 'edsger')", Ulid::new())).await,
        "23P01"
    );
    assert_eq!(
        sqlstate(&client, &format!("DELETE FROM users WHERE id = '{}'", host.user_id)).await,
        "P0001"
    );
    assert_eq!(
        sqlstate(
            &client,
            &format!(
                "INSERT INTO reservations (event_type_id, slot_start, slot_duration) VALUES ('{}', '2030-01-07T10:00:00Z', 45)",
                host.event_type_id
            ),
        )
        .await,
        "22023"
    );
    assert_eq!(
        sqlstate(
            &client,
            &format!(
                "INSERT INTO reservations (event_type_id, slot_start) VALUES ('{}', '9223372036854775807')",
                host.event_type_id
            ),
        )
        .await,
        "22023"
    );
    assert_eq!(
        sqlstate(
            &client,
            &format!(
                r#"SELECT * FROM slots WHERE event_type_id = '{}' AND start >= '-9223372036854775807' AND "end" <= 0"#,
                host.event_type_id
            ),
        )
        .await,
        "22023"
    );
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let (addr, tm) = start_test_server().await;
    let client = connect(addr).await;
    seed_host(&client, "ada").await;

    let (other, connection) = client_config(addr, "slotd", API_KEY)
        .dbname("other")
        .connect(NoTls)
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    assert!(rows(&other, "SELECT * FROM users").await.is_empty());
    assert_eq!(tm.tenant_count(), 2);
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let (addr, _tm) = start_test_server().await;
    let result = client_config(addr, "slotd", "not-the-key").connect(NoTls).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let host = seed_host(&client, "alan").await;

    let id = host.user_id.to_string();
    let found = client
        .query("SELECT * FROM users WHERE id = $1", &[&id])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let username: String = found[0].get("username");
    assert_eq!(username, "alan");
}
