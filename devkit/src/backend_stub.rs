/*!
Stub HTTP du backend de télémétrie

Permet de développer et tester l'agent sans serveur réel. Enregistre toutes
les requêtes reçues, renvoie des réponses configurables et peut simuler des
pannes transitoires (échecs des N prochaines requêtes).
*/

use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

#[derive(Default)]
struct StubState {
    mode_response: Mutex<Value>,
    haptic_response: Mutex<Value>,
    fail_mode_fetches: Mutex<u32>,
    fail_posts: Mutex<u32>,
    mode_fetch_count: Mutex<u32>,
    post_count: Mutex<u32>,
    heart_posts: Mutex<Vec<Value>>,
    sun_posts: Mutex<Vec<Value>>,
    moon_posts: Mutex<Vec<Value>>,
}

/// Backend de télémétrie simulé, lié à un port éphémère local.
#[derive(Clone)]
pub struct StubBackend {
    state: Arc<StubState>,
    base_url: String,
}

impl StubBackend {
    /// Démarre le stub sur 127.0.0.1 avec un port libre.
    pub async fn start() -> Result<Self> {
        let state = Arc::new(StubState {
            mode_response: Mutex::new(serde_json::json!({ "monitoringType": "HeartRate" })),
            haptic_response: Mutex::new(serde_json::json!({ "pulses": 0 })),
            ..Default::default()
        });

        let router = Router::new()
            .route("/get-monitoring-config", get(get_monitoring_config))
            .route("/heartRate", post(post_heart_rate))
            .route("/sun-data", post(post_sun_data))
            .route("/moon-data", post(post_moon_data))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(Self {
            state,
            base_url: format!("http://{addr}"),
        })
    }

    pub fn base_url(&self) -> String {
        self.base_url.clone()
    }

    /// Configure le type de monitoring renvoyé par /get-monitoring-config.
    pub fn set_mode(&self, mode: &str) {
        *self.state.mode_response.lock() = serde_json::json!({ "monitoringType": mode });
    }

    /// Remplace la réponse complète de /get-monitoring-config (corps arbitraire).
    pub fn set_mode_response(&self, body: Value) {
        *self.state.mode_response.lock() = body;
    }

    /// Configure la commande haptique renvoyée par tous les endpoints POST.
    pub fn set_haptic_response(&self, body: Value) {
        *self.state.haptic_response.lock() = body;
    }

    /// Les `n` prochains GET de configuration échouent en HTTP 500.
    pub fn fail_next_mode_fetches(&self, n: u32) {
        *self.state.fail_mode_fetches.lock() = n;
    }

    /// Les `n` prochains POST échouent en HTTP 500.
    pub fn fail_next_posts(&self, n: u32) {
        *self.state.fail_posts.lock() = n;
    }

    /// Nombre total de GET de configuration reçus, échecs compris.
    pub fn mode_fetch_count(&self) -> u32 {
        *self.state.mode_fetch_count.lock()
    }

    /// Nombre total de POST reçus, échecs compris.
    pub fn post_count(&self) -> u32 {
        *self.state.post_count.lock()
    }

    /// Corps acceptés sur /heartRate (pour assertions de tests).
    pub fn heart_posts(&self) -> Vec<Value> {
        self.state.heart_posts.lock().clone()
    }

    /// Corps acceptés sur /sun-data.
    pub fn sun_posts(&self) -> Vec<Value> {
        self.state.sun_posts.lock().clone()
    }

    /// Corps acceptés sur /moon-data.
    pub fn moon_posts(&self) -> Vec<Value> {
        self.state.moon_posts.lock().clone()
    }
}

fn take_failure(counter: &Mutex<u32>) -> bool {
    let mut remaining = counter.lock();
    if *remaining > 0 {
        *remaining = remaining.saturating_sub(1);
        true
    } else {
        false
    }
}

async fn get_monitoring_config(
    State(state): State<Arc<StubState>>,
) -> Result<Json<Value>, StatusCode> {
    *state.mode_fetch_count.lock() += 1;
    if take_failure(&state.fail_mode_fetches) {
        debug!("[STUB] mode fetch failed on purpose");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(Json(state.mode_response.lock().clone()))
}

async fn accept_post(
    state: &StubState,
    log: &Mutex<Vec<Value>>,
    endpoint: &str,
    body: Value,
) -> Result<Json<Value>, StatusCode> {
    *state.post_count.lock() += 1;
    if take_failure(&state.fail_posts) {
        debug!("[STUB] post to {endpoint} failed on purpose");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    debug!("[STUB] accepted post to {endpoint}: {body}");
    log.lock().push(body);
    Ok(Json(state.haptic_response.lock().clone()))
}

async fn post_heart_rate(
    State(state): State<Arc<StubState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    accept_post(&state, &state.heart_posts, "/heartRate", body).await
}

async fn post_sun_data(
    State(state): State<Arc<StubState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    accept_post(&state, &state.sun_posts, "/sun-data", body).await
}

async fn post_moon_data(
    State(state): State<Arc<StubState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    accept_post(&state, &state.moon_posts, "/moon-data", body).await
}
