use rocket::form::{Contextual, Form};
use rocket::response::Redirect;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use crate::auth::UserSession;
use crate::db::DbPool;
use crate::util::{status_sqlx_error, unprocessable};

/// Used when the course does not say how many lessons it plans.
pub const DEFAULT_PLANNED_LESSONS: i64 = 24;

#[derive(Serialize, Deserialize, FromRow, PartialEq, Clone, Debug, Default)]
pub struct Course {
    pub instructor: String,
    pub club: String,
    pub name: String,
    pub planned_lessons: Option<i64>,
    pub price: f64,
}
pub fn planned_lessons_or_default(course: Option<&Course>) -> i64 {
    match course.and_then(|c| c.planned_lessons) {
        Some(n) if n > 0 => n,
        _ => DEFAULT_PLANNED_LESSONS,
    }
}

pub async fn load_course(pool: &SqlitePool) -> Result<Option<Course>, sqlx::Error> {
    sqlx::query_as::<_, Course>("SELECT instructor, club, name, planned_lessons, price FROM course WHERE id=1")
        .fetch_optional(pool)
        .await
}
/// Full record update; the first update creates the singleton row.
pub async fn save_course(course: &Course, pool: &SqlitePool) -> Result<Course, sqlx::Error> {
    let course = sqlx::query_as::<_, Course>("INSERT INTO course (id, instructor, club, name, planned_lessons, price)
                VALUES (1, ?, ?, ?, ?, ?)
                ON CONFLICT (id) DO UPDATE SET
                    instructor=excluded.instructor,
                    club=excluded.club,
                    name=excluded.name,
                    planned_lessons=excluded.planned_lessons,
                    price=excluded.price
                RETURNING instructor, club, name, planned_lessons, price")
        .bind(&course.instructor)
        .bind(&course.club)
        .bind(&course.name)
        .bind(course.planned_lessons)
        .bind(course.price)
        .fetch_one(pool)
        .await?;
    info!("Course updated: {} at {}, {:?} lessons, price {}", course.name, course.club, course.planned_lessons, course.price);
    Ok(course)
}

#[derive(Debug, FromForm)]
struct CourseFormValues<'v> {
    instructor: &'v str,
    club: &'v str,
    name: &'v str,
    planned_lessons: &'v str,
    price: &'v str,
}
impl CourseFormValues<'_> {
    /// Blank numbers mean "not set", anything unparsable rejects the whole form.
    fn to_course(&self) -> anyhow::Result<Course> {
        let planned_lessons = match self.planned_lessons.trim() {
            "" => None,
            s => match s.parse::<i64>()? {
                n if n > 0 => Some(n),
                n => anyhow::bail!("Invalid planned lessons count: {n}"),
            },
        };
        let price = match self.price.trim() {
            "" => 0.0,
            s => s.parse::<f64>()?,
        };
        if !price.is_finite() || price < 0.0 {
            anyhow::bail!("Invalid course price: {price}");
        }
        Ok(Course {
            instructor: self.instructor.trim().to_string(),
            club: self.club.trim().to_string(),
            name: self.name.trim().to_string(),
            planned_lessons,
            price,
        })
    }
}
#[post("/course", data = "<form>")]
async fn post_course<'r>(form: Form<Contextual<'r, CourseFormValues<'r>>>, _user: UserSession, db: &State<DbPool>) -> Result<Redirect, Custom<String>> {
    let Some(vals) = form.value.as_ref() else {
        debug!("Course form rejected: {:?}", form.context);
        return Ok(Redirect::to("/"));
    };
    let course = match vals.to_course() {
        Ok(course) => course,
        Err(e) => {
            debug!("Course form ignored: {e}");
            return Ok(Redirect::to("/"));
        }
    };
    save_course(&course, &db.0).await.map_err(status_sqlx_error)?;
    Ok(Redirect::to("/"))
}

#[get("/api/course")]
async fn get_api_course(_user: UserSession, db: &State<DbPool>) -> Result<Json<Option<Course>>, Custom<String>> {
    let course = load_course(&db.0).await.map_err(status_sqlx_error)?;
    Ok(Json(course))
}
#[put("/api/course", data = "<course>")]
async fn put_api_course(_user: UserSession, course: Json<Course>, db: &State<DbPool>) -> Result<Json<Course>, Custom<String>> {
    if course.price < 0.0 {
        return Err(unprocessable("Course price cannot be negative"));
    }
    let course = save_course(&course, &db.0).await.map_err(status_sqlx_error)?;
    Ok(Json(course))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_course,
            get_api_course,
            put_api_course,
        ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planned_lessons_fall_back_to_default() {
        assert_eq!(planned_lessons_or_default(None), DEFAULT_PLANNED_LESSONS);
        let mut course = Course::default();
        assert_eq!(planned_lessons_or_default(Some(&course)), 24);
        course.planned_lessons = Some(0);
        assert_eq!(planned_lessons_or_default(Some(&course)), 24);
        course.planned_lessons = Some(-3);
        assert_eq!(planned_lessons_or_default(Some(&course)), 24);
        course.planned_lessons = Some(10);
        assert_eq!(planned_lessons_or_default(Some(&course)), 10);
    }

    fn form<'v>(planned_lessons: &'v str, price: &'v str) -> CourseFormValues<'v> {
        CourseFormValues { instructor: " Mario ", club: "TC Roma", name: "Autumn", planned_lessons, price }
    }

    #[test]
    fn course_form_parsing() {
        let course = form("10", "500").to_course().unwrap();
        assert_eq!(course.instructor, "Mario");
        assert_eq!(course.planned_lessons, Some(10));
        assert_eq!(course.price, 500.);
        let course = form("", " ").to_course().unwrap();
        assert_eq!(course.planned_lessons, None);
        assert_eq!(course.price, 0.);
        assert!(form("ten", "500").to_course().is_err());
        assert!(form("10", "abc").to_course().is_err());
        assert!(form("0", "500").to_course().is_err());
        assert!(form("10", "-5").to_course().is_err());
    }
}
