use rocket::form::{Contextual, Form};
use rocket::response::Redirect;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use crate::auth::UserSession;
use crate::db::DbPool;
use crate::util::{status_any_error, status_sqlx_error, unprocessable};

pub type ParticipantId = i64;

#[derive(Serialize, Deserialize, FromRow, PartialEq, Clone, Debug)]
pub struct Participant {
    pub id: ParticipantId,
    pub first_name: String,
    pub last_name: String,
    pub amount_paid: f64,
}
impl Participant {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NewParticipant {
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub amount_paid: f64,
}
impl NewParticipant {
    fn validate(&self) -> anyhow::Result<()> {
        if self.first_name.trim().is_empty() {
            anyhow::bail!("Participant first name must be set");
        }
        if !self.amount_paid.is_finite() || self.amount_paid < 0.0 {
            anyhow::bail!("Invalid amount paid: {}", self.amount_paid);
        }
        Ok(())
    }
}

pub async fn list_participants(pool: &SqlitePool) -> Result<Vec<Participant>, sqlx::Error> {
    sqlx::query_as::<_, Participant>("SELECT id, first_name, last_name, amount_paid FROM participants ORDER BY id")
        .fetch_all(pool)
        .await
}
pub async fn add_participant(participant: &NewParticipant, pool: &SqlitePool) -> anyhow::Result<Participant> {
    participant.validate()?;
    let participant = sqlx::query_as::<_, Participant>("INSERT INTO participants (first_name, last_name, amount_paid)
                VALUES (?, ?, ?)
                RETURNING id, first_name, last_name, amount_paid")
        .bind(participant.first_name.trim())
        .bind(participant.last_name.trim())
        .bind(participant.amount_paid)
        .fetch_one(pool)
        .await?;
    info!("Participant created, id: {}, name: {}", participant.id, participant.full_name());
    Ok(participant)
}

#[derive(Debug, FromForm)]
struct ParticipantFormValues<'v> {
    first_name: &'v str,
    last_name: &'v str,
    amount_paid: Option<f64>,
}
/// Invalid submissions are dropped and the dashboard is shown again unchanged.
#[post("/participant", data = "<form>")]
async fn post_participant<'r>(form: Form<Contextual<'r, ParticipantFormValues<'r>>>, _user: UserSession, db: &State<DbPool>) -> Result<Redirect, Custom<String>> {
    let Some(vals) = form.value.as_ref() else {
        return Ok(Redirect::to("/"));
    };
    let participant = NewParticipant {
        first_name: vals.first_name.to_string(),
        last_name: vals.last_name.to_string(),
        amount_paid: vals.amount_paid.unwrap_or_default(),
    };
    if let Err(e) = participant.validate() {
        debug!("Participant form ignored: {e}");
        return Ok(Redirect::to("/"));
    }
    add_participant(&participant, &db.0).await.map_err(status_any_error)?;
    Ok(Redirect::to("/"))
}

#[get("/api/participants")]
async fn get_api_participants(_user: UserSession, db: &State<DbPool>) -> Result<Json<Vec<Participant>>, Custom<String>> {
    let participants = list_participants(&db.0).await.map_err(status_sqlx_error)?;
    Ok(Json(participants))
}
#[post("/api/participants", data = "<participant>")]
async fn post_api_participant(_user: UserSession, participant: Json<NewParticipant>, db: &State<DbPool>) -> Result<Json<Participant>, Custom<String>> {
    participant.validate().map_err(|e| unprocessable(e.to_string()))?;
    let participant = add_participant(&participant, &db.0).await.map_err(status_any_error)?;
    Ok(Json(participant))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_participant,
            get_api_participants,
            post_api_participant,
        ])
}

#[test]
fn test_validate_new_participant() {
    let mut p = NewParticipant { first_name: "Anna".to_string(), last_name: "".to_string(), amount_paid: 100. };
    assert!(p.validate().is_ok());
    p.first_name = "   ".to_string();
    assert!(p.validate().is_err());
    p.first_name = "Anna".to_string();
    p.amount_paid = -1.;
    assert!(p.validate().is_err());
}
