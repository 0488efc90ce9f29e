use chrono::{Datelike, Months, NaiveDate};
use itertools::Itertools;
use rocket::form::Form;
use rocket::response::Redirect;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::{Deserialize, Serialize};
use crate::auth::UserSession;
use crate::coursedate::{today, LessonTime};
use crate::db::DbPool;
use crate::lesson::{add_lesson, list_lessons, validate_new_lesson_form, Lesson, LessonId};
use crate::util::status_sqlx_error;

const PAST_COLOR: &str = "#94a3b8";
const UPCOMING_COLOR: &str = "#1976d2";
const NO_PARTICIPANTS: &str = "No participants";

/// One lesson as a calendar entry.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub lesson_id: LessonId,
    pub title: String,
    pub start: String,
    pub all_day: bool,
    pub color: String,
    pub tooltip: String,
}
impl CalendarEvent {
    pub fn from_lesson(lesson: &Lesson, today: NaiveDate) -> Self {
        let names = lesson.attendees.iter().map(|a| a.first_name.as_str()).join(", ");
        let title = if names.is_empty() { NO_PARTICIPANTS.to_string() } else { names.clone() };
        let tooltip = lesson.attendees.iter()
            .map(|a| format!("{} {}", a.first_name, a.last_name).trim().to_string())
            .join(", ");
        Self {
            id: lesson.id.to_string(),
            lesson_id: lesson.id,
            title,
            start: format!("{}T{}", lesson.date.format("%F"), lesson.start_time_or_default()),
            all_day: false,
            // a lesson held today is still drawn as upcoming
            color: if lesson.date < today { PAST_COLOR } else { UPCOMING_COLOR }.to_string(),
            tooltip,
        }
    }
}
pub fn calendar_events(lessons: &[Lesson], today: NaiveDate) -> Vec<CalendarEvent> {
    lessons.iter().map(|l| CalendarEvent::from_lesson(l, today)).collect()
}

#[derive(Serialize, Debug)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub day: u32,
    pub in_month: bool,
    pub is_today: bool,
    pub events: Vec<CalendarEvent>,
}

#[derive(Serialize, Debug)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

/// Month view with whole weeks, Monday first.
#[derive(Serialize, Debug)]
pub struct CalendarMonth {
    pub year: i32,
    pub month: u32,
    pub title: String,
    pub prev: YearMonth,
    pub next: YearMonth,
    pub weeks: Vec<Vec<CalendarDay>>,
}

fn first_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
}

pub fn calendar_month(year: i32, month: u32, lessons: &[Lesson], today: NaiveDate) -> Option<CalendarMonth> {
    let first = first_of_month(year, month)?;
    let last = first.checked_add_months(Months::new(1))?.pred_opt()?;
    let prev = first.checked_sub_months(Months::new(1))?;
    let next = first.checked_add_months(Months::new(1))?;
    let grid_start = first - chrono::Days::new(first.weekday().num_days_from_monday() as u64);
    let grid_end = last + chrono::Days::new(6 - last.weekday().num_days_from_monday() as u64);

    let mut events_by_day = lessons.iter()
        .filter(|l| l.date >= grid_start && l.date <= grid_end)
        .map(|l| (l.date, CalendarEvent::from_lesson(l, today)))
        .into_group_map();

    let days = grid_start.iter_days()
        .take_while(|d| *d <= grid_end)
        .map(|date| CalendarDay {
            date,
            day: date.day(),
            in_month: date.month() == month,
            is_today: date == today,
            events: events_by_day.remove(&date).unwrap_or_default(),
        })
        .collect::<Vec<_>>();
    let weeks = days.into_iter()
        .chunks(7)
        .into_iter()
        .map(|week| week.collect())
        .collect();

    Some(CalendarMonth {
        year,
        month,
        title: first.format("%B %Y").to_string(),
        prev: YearMonth { year: prev.year(), month: prev.month() },
        next: YearMonth { year: next.year(), month: next.month() },
        weeks,
    })
}

#[get("/calendar?<year>&<month>")]
async fn get_calendar(year: Option<i32>, month: Option<u32>, user: UserSession, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let today = today();
    let year = year.unwrap_or(today.year());
    let month = month.unwrap_or(today.month());
    let lessons = list_lessons(&db.0).await.map_err(status_sqlx_error)?;
    let Some(calendar) = calendar_month(year, month, &lessons, today)
        .or_else(|| calendar_month(today.year(), today.month(), &lessons, today)) else {
        return Err(Custom(rocket::http::Status::BadRequest, format!("Invalid month {year}-{month}")));
    };
    Ok(Template::render("calendar", context! {
        user: user.user_info,
        calendar,
        default_start_time: LessonTime::default(),
    }))
}

#[derive(Debug, FromForm)]
struct CalendarLessonFormValues<'v> {
    date: &'v str,
    #[field(default = "")]
    start_time: &'v str,
}
/// Adds an empty lesson on the clicked day, 10:00 unless another time is given.
#[post("/calendar/lesson", data = "<form>")]
async fn post_calendar_lesson<'r>(form: Form<CalendarLessonFormValues<'r>>, _user: UserSession, db: &State<DbPool>) -> Result<Redirect, Custom<String>> {
    let mut lesson = match validate_new_lesson_form(form.date, form.start_time) {
        Ok(lesson) => lesson,
        Err(e) => {
            debug!("Calendar lesson form ignored: {}", e.1);
            return Ok(Redirect::to("/calendar"));
        }
    };
    lesson.start_time = Some(LessonTime::or_default(lesson.start_time));
    let lesson = add_lesson(&lesson, &db.0).await.map_err(status_sqlx_error)?;
    Ok(Redirect::to(uri!(get_calendar(Some(lesson.date.year()), Some(lesson.date.month())))))
}

#[get("/api/calendar/events")]
async fn get_api_calendar_events(_user: UserSession, db: &State<DbPool>) -> Result<Json<Vec<CalendarEvent>>, Custom<String>> {
    let lessons = list_lessons(&db.0).await.map_err(status_sqlx_error)?;
    Ok(Json(calendar_events(&lessons, today())))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_calendar,
            post_calendar_lesson,
            get_api_calendar_events,
        ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lesson::Attendee;

    fn attendee(id: i64, first_name: &str, last_name: &str) -> Attendee {
        Attendee { id, first_name: first_name.to_string(), last_name: last_name.to_string() }
    }
    fn lesson(id: LessonId, date: NaiveDate, start_time: Option<LessonTime>, attendees: Vec<Attendee>) -> Lesson {
        Lesson { id, date, start_time, attendees }
    }

    #[test]
    fn event_from_lesson() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        let past = lesson(1, NaiveDate::from_ymd_opt(2025, 6, 9).unwrap(), None,
                          vec![attendee(1, "Anna", "Rossi"), attendee(2, "Bruno", "Verdi")]);
        let ev = CalendarEvent::from_lesson(&past, today);
        assert_eq!(ev.id, "1");
        assert_eq!(ev.title, "Anna, Bruno");
        assert_eq!(ev.tooltip, "Anna Rossi, Bruno Verdi");
        assert_eq!(ev.start, "2025-06-09T10:00");
        assert_eq!(ev.color, PAST_COLOR);

        let empty_today = lesson(2, today, LessonTime::new(17, 30), vec![]);
        let ev = CalendarEvent::from_lesson(&empty_today, today);
        assert_eq!(ev.title, NO_PARTICIPANTS);
        assert_eq!(ev.start, "2025-06-10T17:30");
        assert_eq!(ev.color, UPCOMING_COLOR);
    }

    #[test]
    fn month_grid_covers_whole_weeks() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        let lessons = vec![
            lesson(1, NaiveDate::from_ymd_opt(2025, 5, 26).unwrap(), None, vec![]),
            lesson(2, NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(), None, vec![]),
            lesson(3, NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(), LessonTime::new(18, 0), vec![]),
            lesson(4, NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(), None, vec![]),
        ];
        let cal = calendar_month(2025, 6, &lessons, today).unwrap();
        // June 2025 starts on Sunday and ends on Monday
        assert_eq!(cal.weeks.len(), 6);
        assert!(cal.weeks.iter().all(|w| w.len() == 7));
        assert_eq!(cal.weeks[0][0].date, NaiveDate::from_ymd_opt(2025, 5, 26).unwrap());
        assert!(!cal.weeks[0][0].in_month);
        assert_eq!(cal.weeks[0][0].events.len(), 1);
        let tenth = cal.weeks.iter().flatten().find(|d| d.is_today).unwrap();
        assert_eq!(tenth.day, 10);
        assert_eq!(tenth.events.iter().map(|e| e.lesson_id).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(cal.weeks.iter().flatten().map(|d| d.events.len()).sum::<usize>(), 3);
        assert_eq!((cal.prev.year, cal.prev.month), (2025, 5));
        assert_eq!((cal.next.year, cal.next.month), (2025, 7));
        assert_eq!(cal.title, "June 2025");
    }

    #[test]
    fn month_grid_wraps_year() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let cal = calendar_month(2025, 1, &[], today).unwrap();
        assert_eq!((cal.prev.year, cal.prev.month), (2024, 12));
        let cal = calendar_month(2025, 12, &[], today).unwrap();
        assert_eq!((cal.next.year, cal.next.month), (2026, 1));
        assert!(calendar_month(2025, 13, &[], today).is_none());
    }
}
