//! Test fixtures: signed tokens and seeded records.

use chrono::Utc;
use common::jwt::UserClaims;
use common::types::Role;
use hub_service::models::{Appointment, AppointmentStatus, Conversation};
use hub_service::repositories::memory::MemoryStore;
use jsonwebtoken::{encode, EncodingKey, Header};

/// HS256 secret every harness server is configured with.
pub const TEST_JWT_SECRET: &str = "hub-test-secret-0123456789abcdef0123456789";

/// Mint a token valid for one hour.
pub fn mint_token(user_id: &str, role: Role) -> String {
    let now = Utc::now().timestamp();
    sign(&UserClaims::new(user_id, role, now + 3600, now), TEST_JWT_SECRET)
}

/// Mint a token that expired an hour ago.
pub fn mint_expired_token(user_id: &str, role: Role) -> String {
    let now = Utc::now().timestamp();
    sign(
        &UserClaims::new(user_id, role, now - 3600, now - 7200),
        TEST_JWT_SECRET,
    )
}

/// Mint a token signed with the wrong secret.
pub fn mint_forged_token(user_id: &str, role: Role) -> String {
    let now = Utc::now().timestamp();
    sign(
        &UserClaims::new(user_id, role, now + 3600, now),
        "not-the-hub-secret-0123456789abcdef",
    )
}

fn sign(claims: &UserClaims, secret: &str) -> String {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token signing should not fail")
}

/// A booked appointment with no call history.
pub fn booked_appointment(id: &str, doctor_id: &str, user_id: &str) -> Appointment {
    Appointment {
        id: id.to_string(),
        doctor_id: doctor_id.to_string(),
        user_id: user_id.to_string(),
        appointment_status: AppointmentStatus::Booked,
        call_start_time: None,
        call_end_time: None,
    }
}

/// A two-party conversation with no messages.
pub fn conversation(id: &str, members: &[&str]) -> Conversation {
    Conversation {
        id: id.to_string(),
        members: members.iter().map(|m| (*m).to_string()).collect(),
        last_message: None,
        updated_at: Utc::now(),
    }
}

pub async fn seed_appointment(store: &MemoryStore, id: &str, doctor_id: &str, user_id: &str) {
    store
        .appointments()
        .insert(booked_appointment(id, doctor_id, user_id))
        .await;
}

pub async fn seed_conversation(store: &MemoryStore, id: &str, members: &[&str]) {
    store
        .conversations()
        .insert(conversation(id, members))
        .await;
}
