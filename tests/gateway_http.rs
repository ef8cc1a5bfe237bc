// Integration tests for the HTTP backend client against a local axum server.

use std::time::Duration;

use axum::{extract::Json, http::StatusCode, routing::post, Router};
use serde_json::{json, Value};

use guild_relay::gateway::{ActionKind, Backend, CommandRequest, HttpBackend, RewardOutcome};

async fn scoring(Json(body): Json<Value>) -> Json<Value> {
    let reply = match body["action"].as_str() {
        Some("message_activity") => json!({
            "success": true,
            "xp_gained": 15,
            "level_up": true,
            "message": "🎉 Ann reached level 3!"
        }),
        Some("presence_activity") => json!({ "type": "cooldown", "remaining": 42 }),
        Some("get_user_data") if body["user_id"] == "1" => json!({
            "success": true,
            "user_data": {
                "faction": { "name": "Ember", "emoji": "🔥" },
                "custom_nickname": "Blaze"
            }
        }),
        Some("get_user_data") => json!({ "success": true, "user_data": null }),
        _ => json!({ "error": "unknown action" }),
    };
    Json(reply)
}

async fn duels(Json(body): Json<Value>) -> Json<Value> {
    if body["command"] == "!expired_duels" {
        return Json(json!({
            "expired_duels": [{ "duel_id": 3 }, { "duel_id": 4, "channel_name": "arena-4" }]
        }));
    }
    Json(json!({
        "response": format!("Challenge sent by {}", body["username"].as_str().unwrap_or("?")),
        "create_duel_channel": true,
        "channel_data": { "name": "duel-9", "duel_id": 9, "players": ["10", 20] }
    }))
}

async fn broken() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn garbage() -> &'static str {
    "<html>Fatal error</html>"
}

async fn stalled() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(30)).await;
    Json(json!({ "success": true, "xp_gained": 5 }))
}

async fn serve() -> String {
    let app = Router::new()
        .route("/scoring", post(scoring))
        .route("/duels", post(duels))
        .route("/broken", post(broken))
        .route("/garbage", post(garbage))
        .route("/stalled", post(stalled));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client(base: &str, scoring: &str, duels: &str) -> HttpBackend {
    client_with_timeout(base, scoring, duels, Duration::from_secs(5))
}

fn client_with_timeout(base: &str, scoring: &str, duels: &str, timeout: Duration) -> HttpBackend {
    HttpBackend::new(&format!("{base}{scoring}"), &format!("{base}{duels}"), timeout).unwrap()
}

#[tokio::test]
async fn test_reward_outcomes_from_scoring_replies() {
    let base = serve().await;
    let backend = client(&base, "/scoring", "/duels");

    let outcome = backend
        .request_reward(ActionKind::MessageActivity, 1, "Ann")
        .await;
    assert_eq!(
        outcome,
        RewardOutcome::Granted {
            amount: 15,
            leveled_up: true,
            announce_text: Some("🎉 Ann reached level 3!".into()),
        }
    );

    let outcome = backend
        .request_reward(ActionKind::PresenceActivity, 1, "Ann")
        .await;
    assert_eq!(outcome, RewardOutcome::OnCooldown { remaining_seconds: 42 });

    let outcome = backend.request_reward(ActionKind::GetStats, 1, "Ann").await;
    assert_eq!(
        outcome,
        RewardOutcome::Denied {
            reason: "unknown action".into()
        }
    );
}

#[tokio::test]
async fn test_server_error_is_unreachable() {
    let base = serve().await;
    let backend = client(&base, "/broken", "/broken");
    let outcome = backend
        .request_reward(ActionKind::MessageActivity, 1, "Ann")
        .await;
    assert_eq!(outcome, RewardOutcome::Unreachable);
    assert!(backend.expired_duels().await.is_err());
}

#[tokio::test]
async fn test_non_json_reply_is_unreachable() {
    let base = serve().await;
    let backend = client(&base, "/garbage", "/garbage");
    let outcome = backend
        .request_reward(ActionKind::PresenceActivity, 1, "Ann")
        .await;
    assert_eq!(outcome, RewardOutcome::Unreachable);
}

#[tokio::test]
async fn test_slow_backend_times_out_as_unreachable() {
    let base = serve().await;
    let backend = client_with_timeout(&base, "/stalled", "/stalled", Duration::from_secs(1));

    let started = std::time::Instant::now();
    let outcome = backend
        .request_reward(ActionKind::PresenceActivity, 1, "Ann")
        .await;
    assert_eq!(outcome, RewardOutcome::Unreachable);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_refused_connection_is_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let backend = client(&format!("http://{addr}"), "/scoring", "/duels");
    let outcome = backend
        .request_reward(ActionKind::MessageActivity, 1, "Ann")
        .await;
    assert_eq!(outcome, RewardOutcome::Unreachable);
}

#[tokio::test]
async fn test_fetch_traits() {
    let base = serve().await;
    let backend = client(&base, "/scoring", "/duels");

    let traits = backend.fetch_traits(1, "ann").await.unwrap().unwrap();
    let faction = traits.faction.unwrap();
    assert_eq!(faction.display_name, "Ember");
    assert_eq!(faction.glyph, "🔥");
    assert_eq!(traits.custom_nickname.as_deref(), Some("Blaze"));

    assert_eq!(backend.fetch_traits(2, "rex").await.unwrap(), None);
}

#[tokio::test]
async fn test_command_and_expired_duels() {
    let base = serve().await;
    let backend = client(&base, "/scoring", "/duels");

    let reply = backend
        .run_command(&CommandRequest {
            command: "!duel @rex".into(),
            user_id: "10".into(),
            username: "ann".into(),
            duel_id: None,
        })
        .await
        .unwrap();
    assert_eq!(reply.user_text().as_deref(), Some("Challenge sent by ann"));
    assert!(reply.create_duel_channel);
    let data = reply.channel_data.unwrap();
    assert_eq!(data.duel_id, 9);
    assert_eq!(data.players, vec![10, 20]);

    let expired = backend.expired_duels().await.unwrap();
    assert_eq!(expired.len(), 2);
    assert_eq!(expired[0].channel_name(), "duel-3");
    assert_eq!(expired[1].channel_name(), "arena-4");
}
