use axum::{Json, extract::State};

use super::AppState;
use crate::core::jobs::JobSnapshot;
use crate::core::profiles::PublicProfile;

pub async fn get_profiles(State(state): State<AppState>) -> Json<Vec<PublicProfile>> {
    Json(state.profiles.sanitized())
}

pub async fn get_jobs(State(state): State<AppState>) -> Json<Vec<JobSnapshot>> {
    Json(state.controller.registry().list().await)
}
