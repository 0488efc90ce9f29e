use chrono::NaiveDate;
use itertools::Itertools;
use rocket::form::{Contextual, Form};
use rocket::http::Status;
use rocket::response::Redirect;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use tenniscourse_macros::ChangedFields;
use crate::auth::UserSession;
use crate::coursedate::{parse_date, today, LessonTime};
use crate::db::DbPool;
use crate::participant::{list_participants, Participant, ParticipantId};
use crate::stats::{classify, LessonSize, LessonStatus};
use crate::util::{is_foreign_key_violation, status_sqlx_error, unprocessable};

pub type LessonId = i64;

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Attendee {
    pub id: ParticipantId,
    pub first_name: String,
    pub last_name: String,
}

/// A lesson with the participants attending it.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Lesson {
    pub id: LessonId,
    pub date: NaiveDate,
    pub start_time: Option<LessonTime>,
    pub attendees: Vec<Attendee>,
}
impl Lesson {
    pub fn start_time_or_default(&self) -> LessonTime {
        LessonTime::or_default(self.start_time)
    }
    pub fn is_attended_by(&self, participant_id: ParticipantId) -> bool {
        self.attendees.iter().any(|a| a.id == participant_id)
    }
    pub fn size(&self) -> Option<LessonSize> {
        LessonSize::from_attendee_count(self.attendees.len())
    }
}

#[derive(FromRow, Debug)]
struct LessonAttendeeRow {
    id: LessonId,
    date: NaiveDate,
    start_time: Option<LessonTime>,
    participant_id: Option<ParticipantId>,
    first_name: Option<String>,
    last_name: Option<String>,
}

#[derive(Serialize, Deserialize, FromRow, PartialEq, Clone, Debug)]
pub struct AttendanceLink {
    pub lesson_id: LessonId,
    pub participant_id: ParticipantId,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NewLesson {
    pub date: NaiveDate,
    #[serde(default)]
    pub start_time: Option<LessonTime>,
    #[serde(default)]
    pub participant_ids: Vec<ParticipantId>,
}

#[derive(Serialize, Deserialize, ChangedFields, Default, Clone, Debug)]
pub struct LessonChange {
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    /// `Some(None)` clears the start time, so the lesson falls back to 10:00.
    #[serde(default, deserialize_with = "deserialize_present")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Option<LessonTime>>,
}

/// Tells an explicit `null` apart from a missing field.
fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct DeletedLesson {
    pub lesson_id: LessonId,
    pub removed_attendances: u64,
}

const SELECT_LESSONS: &str = "SELECT l.id, l.date, l.start_time,
            p.id AS participant_id, p.first_name, p.last_name
        FROM lessons AS l
        LEFT JOIN lesson_participants AS lp ON lp.lesson_id = l.id
        LEFT JOIN participants AS p ON p.id = lp.participant_id";
const ORDER_LESSONS: &str = " ORDER BY l.date, COALESCE(l.start_time, '10:00'), l.id, p.id";

fn rows_to_lessons(rows: Vec<LessonAttendeeRow>) -> Vec<Lesson> {
    let mut lessons = Vec::new();
    let chunks = rows.into_iter().chunk_by(|row| row.id);
    for (_, mut rows) in &chunks {
        let Some(first) = rows.next() else { continue };
        let mut lesson = Lesson {
            id: first.id,
            date: first.date,
            start_time: first.start_time,
            attendees: vec![],
        };
        for row in std::iter::once(first).chain(rows) {
            if let Some(participant_id) = row.participant_id {
                lesson.attendees.push(Attendee {
                    id: participant_id,
                    first_name: row.first_name.unwrap_or_default(),
                    last_name: row.last_name.unwrap_or_default(),
                });
            }
        }
        lessons.push(lesson);
    }
    lessons
}

/// All lessons ordered by date and start time, attendees resolved.
pub async fn list_lessons(pool: &SqlitePool) -> Result<Vec<Lesson>, sqlx::Error> {
    let rows = sqlx::query_as::<_, LessonAttendeeRow>(&format!("{SELECT_LESSONS}{ORDER_LESSONS}"))
        .fetch_all(pool)
        .await?;
    Ok(rows_to_lessons(rows))
}
pub async fn load_lesson(lesson_id: LessonId, pool: &SqlitePool) -> Result<Lesson, sqlx::Error> {
    let rows = sqlx::query_as::<_, LessonAttendeeRow>(&format!("{SELECT_LESSONS} WHERE l.id=?{ORDER_LESSONS}"))
        .bind(lesson_id)
        .fetch_all(pool)
        .await?;
    rows_to_lessons(rows).into_iter().next().ok_or(sqlx::Error::RowNotFound)
}

pub async fn add_lesson(lesson: &NewLesson, pool: &SqlitePool) -> Result<Lesson, sqlx::Error> {
    let mut txn = pool.begin().await?;
    let (lesson_id, ): (LessonId, ) = sqlx::query_as("INSERT INTO lessons (date, start_time) VALUES (?, ?) RETURNING id")
        .bind(lesson.date)
        .bind(lesson.start_time.map(|t| t.to_string()))
        .fetch_one(&mut *txn)
        .await?;
    for participant_id in lesson.participant_ids.iter().unique() {
        sqlx::query("INSERT INTO lesson_participants (lesson_id, participant_id) VALUES (?, ?)")
            .bind(lesson_id)
            .bind(participant_id)
            .execute(&mut *txn)
            .await?;
    }
    txn.commit().await?;
    info!("Lesson created, id: {lesson_id}, date: {}, participants: {:?}", lesson.date, lesson.participant_ids);
    load_lesson(lesson_id, pool).await
}

/// Removes the attendance links of the lesson first, then the lesson itself.
pub async fn delete_lesson(lesson_id: LessonId, pool: &SqlitePool) -> Result<DeletedLesson, sqlx::Error> {
    let mut txn = pool.begin().await?;
    let links = sqlx::query("DELETE FROM lesson_participants WHERE lesson_id=?")
        .bind(lesson_id)
        .execute(&mut *txn)
        .await?;
    let res = sqlx::query("DELETE FROM lessons WHERE id=?")
        .bind(lesson_id)
        .execute(&mut *txn)
        .await?;
    if res.rows_affected() == 0 {
        txn.rollback().await?;
        return Err(sqlx::Error::RowNotFound);
    }
    txn.commit().await?;
    info!("Lesson deleted, id: {lesson_id}, attendance links removed: {}", links.rows_affected());
    Ok(DeletedLesson { lesson_id, removed_attendances: links.rows_affected() })
}

pub async fn update_lesson(lesson_id: LessonId, change: &LessonChange, pool: &SqlitePool) -> Result<Lesson, sqlx::Error> {
    let fields = change.changed_fields();
    if !fields.is_empty() {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE lessons SET ");
        let mut assignments = qb.separated(", ");
        for fld in &fields {
            assignments.push(format!("{fld}="));
            match *fld {
                "date" => assignments.push_bind_unseparated(change.date),
                "start_time" => assignments.push_bind_unseparated(change.start_time.flatten().map(|t| t.to_string())),
                _ => unreachable!("LessonChange has no field {fld}"),
            };
        }
        qb.push(" WHERE id=").push_bind(lesson_id);
        let res = qb.build().execute(pool).await?;
        if res.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        debug!("Lesson id: {lesson_id} updated, fields: {fields:?}");
    }
    load_lesson(lesson_id, pool).await
}

/// Returns `None` when the participant already attends the lesson.
pub async fn add_attendance(lesson_id: LessonId, participant_id: ParticipantId, pool: &SqlitePool) -> Result<Option<AttendanceLink>, sqlx::Error> {
    let link = sqlx::query_as::<_, AttendanceLink>("INSERT INTO lesson_participants (lesson_id, participant_id)
                VALUES (?, ?)
                ON CONFLICT DO NOTHING
                RETURNING lesson_id, participant_id")
        .bind(lesson_id)
        .bind(participant_id)
        .fetch_optional(pool)
        .await?;
    Ok(link)
}
/// Returns `false` when there was no such link.
pub async fn remove_attendance(lesson_id: LessonId, participant_id: ParticipantId, pool: &SqlitePool) -> Result<bool, sqlx::Error> {
    let res = sqlx::query("DELETE FROM lesson_participants WHERE lesson_id=? AND participant_id=?")
        .bind(lesson_id)
        .bind(participant_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

fn attendance_error(err: sqlx::Error) -> Custom<String> {
    if is_foreign_key_violation(&err) {
        Custom(Status::NotFound, "Lesson or participant does not exist".to_string())
    } else {
        status_sqlx_error(err)
    }
}

#[derive(Serialize, Debug)]
struct LessonDetail {
    #[serde(flatten)]
    lesson: Lesson,
    starts_at: LessonTime,
    status: LessonStatus,
    size: Option<LessonSize>,
}

#[get("/lesson/<lesson_id>")]
async fn get_lesson(lesson_id: LessonId, user: UserSession, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let pool = &db.0;
    let (lesson, participants) = rocket::tokio::try_join!(
        load_lesson(lesson_id, pool),
        list_participants(pool),
    ).map_err(status_sqlx_error)?;
    let candidates = participants.into_iter()
        .filter(|p| !lesson.is_attended_by(p.id))
        .collect::<Vec<Participant>>();
    let lesson = LessonDetail {
        starts_at: lesson.start_time_or_default(),
        status: classify(lesson.date, today()),
        size: lesson.size(),
        lesson,
    };
    Ok(Template::render("lesson", context! {
        user: user.user_info,
        lesson,
        candidates,
    }))
}

#[derive(Debug, FromForm)]
struct LessonFormValues<'v> {
    date: &'v str,
    start_time: &'v str,
}
#[post("/lesson/<lesson_id>", data = "<form>")]
async fn post_lesson<'r>(lesson_id: LessonId, form: Form<Contextual<'r, LessonFormValues<'r>>>, _user: UserSession, db: &State<DbPool>) -> Result<Redirect, Custom<String>> {
    let back = Redirect::to(uri!(get_lesson(lesson_id)));
    let Some(vals) = form.value.as_ref() else {
        return Ok(back);
    };
    let (Ok(date), Ok(start_time)) = (parse_date(vals.date), LessonTime::parse(vals.start_time)) else {
        debug!("Lesson form ignored, date: '{}', start time: '{}'", vals.date, vals.start_time);
        return Ok(back);
    };
    let change = LessonChange { date: Some(date), start_time: Some(Some(start_time)) };
    update_lesson(lesson_id, &change, &db.0).await.map_err(status_sqlx_error)?;
    Ok(back)
}
#[post("/lesson/<lesson_id>/delete")]
async fn post_lesson_delete(lesson_id: LessonId, _user: UserSession, db: &State<DbPool>) -> Result<Redirect, Custom<String>> {
    delete_lesson(lesson_id, &db.0).await.map_err(status_sqlx_error)?;
    Ok(Redirect::to("/calendar"))
}
#[derive(Debug, FromForm)]
struct AttendanceFormValues {
    participant_id: Option<ParticipantId>,
}
#[post("/lesson/<lesson_id>/attendance", data = "<form>")]
async fn post_lesson_attendance(lesson_id: LessonId, form: Form<AttendanceFormValues>, _user: UserSession, db: &State<DbPool>) -> Result<Redirect, Custom<String>> {
    if let Some(participant_id) = form.participant_id {
        add_attendance(lesson_id, participant_id, &db.0).await.map_err(attendance_error)?;
    }
    Ok(Redirect::to(uri!(get_lesson(lesson_id))))
}
#[post("/lesson/<lesson_id>/attendance/<participant_id>/delete")]
async fn post_lesson_attendance_delete(lesson_id: LessonId, participant_id: ParticipantId, _user: UserSession, db: &State<DbPool>) -> Result<Redirect, Custom<String>> {
    remove_attendance(lesson_id, participant_id, &db.0).await.map_err(status_sqlx_error)?;
    Ok(Redirect::to(uri!(get_lesson(lesson_id))))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct LessonWithStatus {
    #[serde(flatten)]
    pub lesson: Lesson,
    pub status: LessonStatus,
    pub is_done: bool,
}
#[get("/api/lessons?<status>")]
async fn get_api_lessons(status: Option<LessonStatus>, _user: UserSession, db: &State<DbPool>) -> Result<Json<Vec<LessonWithStatus>>, Custom<String>> {
    let today = today();
    let lessons = list_lessons(&db.0).await.map_err(status_sqlx_error)?
        .into_iter()
        .map(|lesson| {
            let lesson_status = classify(lesson.date, today);
            LessonWithStatus { lesson, status: lesson_status, is_done: lesson_status == LessonStatus::Done }
        })
        .filter(|l| status.is_none_or(|status| l.status == status))
        .collect();
    Ok(Json(lessons))
}
#[post("/api/lessons", data = "<lesson>")]
async fn post_api_lesson(lesson: Json<NewLesson>, _user: UserSession, db: &State<DbPool>) -> Result<Json<Lesson>, Custom<String>> {
    let lesson = add_lesson(&lesson, &db.0).await.map_err(attendance_error)?;
    Ok(Json(lesson))
}
#[patch("/api/lessons/<lesson_id>", data = "<change>")]
async fn patch_api_lesson(lesson_id: LessonId, change: Json<LessonChange>, _user: UserSession, db: &State<DbPool>) -> Result<Json<Lesson>, Custom<String>> {
    let lesson = update_lesson(lesson_id, &change, &db.0).await.map_err(status_sqlx_error)?;
    Ok(Json(lesson))
}
#[delete("/api/lessons/<lesson_id>")]
async fn delete_api_lesson(lesson_id: LessonId, _user: UserSession, db: &State<DbPool>) -> Result<Json<DeletedLesson>, Custom<String>> {
    let deleted = delete_lesson(lesson_id, &db.0).await.map_err(status_sqlx_error)?;
    Ok(Json(deleted))
}
#[post("/api/lessons/<lesson_id>/participants/<participant_id>")]
async fn post_api_attendance(lesson_id: LessonId, participant_id: ParticipantId, _user: UserSession, db: &State<DbPool>) -> Result<Json<AttendanceLink>, Custom<String>> {
    match add_attendance(lesson_id, participant_id, &db.0).await.map_err(attendance_error)? {
        Some(link) => Ok(Json(link)),
        None => Err(Custom(Status::Conflict, format!("Participant {participant_id} already attends lesson {lesson_id}"))),
    }
}
#[delete("/api/lessons/<lesson_id>/participants/<participant_id>")]
async fn delete_api_attendance(lesson_id: LessonId, participant_id: ParticipantId, _user: UserSession, db: &State<DbPool>) -> Result<Json<AttendanceLink>, Custom<String>> {
    if remove_attendance(lesson_id, participant_id, &db.0).await.map_err(status_sqlx_error)? {
        Ok(Json(AttendanceLink { lesson_id, participant_id }))
    } else {
        Err(Custom(Status::NotFound, format!("Participant {participant_id} does not attend lesson {lesson_id}")))
    }
}

pub(crate) fn validate_new_lesson_form(date: &str, start_time: &str) -> Result<NewLesson, Custom<String>> {
    let date = parse_date(date).map_err(|e| unprocessable(e.to_string()))?;
    let start_time = if start_time.trim().is_empty() {
        None
    } else {
        Some(LessonTime::parse(start_time).map_err(|e| unprocessable(e.to_string()))?)
    };
    Ok(NewLesson { date, start_time, participant_ids: vec![] })
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_lesson,
            post_lesson,
            post_lesson_delete,
            post_lesson_attendance,
            post_lesson_attendance_delete,
            get_api_lessons,
            post_api_lesson,
            patch_api_lesson,
            delete_api_lesson,
            post_api_attendance,
            delete_api_attendance,
        ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: LessonId, day: u32, participant: Option<(ParticipantId, &str)>) -> LessonAttendeeRow {
        LessonAttendeeRow {
            id,
            date: NaiveDate::from_ymd_opt(2025, 4, day).unwrap(),
            start_time: None,
            participant_id: participant.map(|p| p.0),
            first_name: participant.map(|p| p.1.to_string()),
            last_name: participant.map(|_| String::new()),
        }
    }

    #[test]
    fn joined_rows_group_into_lessons() {
        let lessons = rows_to_lessons(vec![
            row(1, 2, Some((10, "Anna"))),
            row(1, 2, Some((11, "Bruno"))),
            row(2, 3, None),
            row(3, 4, Some((10, "Anna"))),
        ]);
        assert_eq!(lessons.len(), 3);
        assert_eq!(lessons[0].attendees.iter().map(|a| a.id).collect::<Vec<_>>(), vec![10, 11]);
        assert!(lessons[1].attendees.is_empty());
        assert!(lessons[2].is_attended_by(10));
        assert!(!lessons[2].is_attended_by(11));
        assert_eq!(lessons[1].start_time_or_default().to_string(), "10:00");
    }

    #[test]
    fn lesson_change_reports_set_fields() {
        let mut change = LessonChange::default();
        assert!(change.changed_fields().is_empty());
        change.start_time = Some(LessonTime::new(9, 0));
        assert_eq!(change.changed_fields(), vec!["start_time"]);
        change.date = NaiveDate::from_ymd_opt(2025, 4, 1);
        assert_eq!(change.changed_fields(), vec!["date", "start_time"]);
    }

    #[test]
    fn lesson_change_null_start_time_clears_it() {
        let change: LessonChange = serde_json::from_str(r#"{"start_time": null}"#).unwrap();
        assert_eq!(change.start_time, Some(None));
        assert_eq!(change.changed_fields(), vec!["start_time"]);
        let change: LessonChange = serde_json::from_str(r#"{"date": "2025-04-01"}"#).unwrap();
        assert_eq!(change.start_time, None);
        assert_eq!(change.changed_fields(), vec!["date"]);
        let change: LessonChange = serde_json::from_str(r#"{"start_time": "18:15"}"#).unwrap();
        assert_eq!(change.start_time, Some(LessonTime::new(18, 15)));
    }

    #[test]
    fn new_lesson_form_validation() {
        let lesson = validate_new_lesson_form("2025-04-01", "").unwrap();
        assert_eq!(lesson.start_time, None);
        let lesson = validate_new_lesson_form("2025-04-01", "18:30").unwrap();
        assert_eq!(lesson.start_time, LessonTime::new(18, 30));
        assert_eq!(validate_new_lesson_form("01/04/2025", "").unwrap_err().0, Status::UnprocessableEntity);
    }
}
