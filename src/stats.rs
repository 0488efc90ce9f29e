use chrono::NaiveDate;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};
use rocket_dyn_templates::{context, Template};
use serde::{Deserialize, Serialize};
use crate::auth::UserSession;
use crate::course::{load_course, planned_lessons_or_default, Course};
use crate::coursedate::{days_until, today, LessonTime};
use crate::db::DbPool;
use crate::lesson::{list_lessons, Lesson};
use crate::participant::{list_participants, Participant};
use crate::util::status_sqlx_error;

#[derive(Serialize, Deserialize, FromFormField, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
pub enum LessonStatus {
    #[field(value = "done")]
    Done,
    #[field(value = "upcoming")]
    Upcoming,
}

/// A lesson is done from its scheduled day on, time of day is not considered.
pub fn classify(lesson_date: NaiveDate, reference_date: NaiveDate) -> LessonStatus {
    if lesson_date <= reference_date {
        LessonStatus::Done
    } else {
        LessonStatus::Upcoming
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
pub enum LessonSize {
    Single,
    Pair,
    Multiple,
}
impl LessonSize {
    pub fn from_attendee_count(count: usize) -> Option<Self> {
        match count {
            0 => None,
            1 => Some(Self::Single),
            2 => Some(Self::Pair),
            _ => Some(Self::Multiple),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Default, Clone, Copy, Debug)]
pub struct SizeBreakdown {
    pub single: usize,
    pub pair: usize,
    pub multiple: usize,
}
impl SizeBreakdown {
    fn count(&mut self, size: LessonSize) {
        match size {
            LessonSize::Single => self.single += 1,
            LessonSize::Pair => self.pair += 1,
            LessonSize::Multiple => self.multiple += 1,
        }
    }
    pub fn total(&self) -> usize {
        self.single + self.pair + self.multiple
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct NextLesson {
    pub lesson: Lesson,
    pub start_time: LessonTime,
    pub size: Option<LessonSize>,
    pub days_remaining: i64,
}
impl NextLesson {
    fn new(lesson: &Lesson, today: NaiveDate) -> Self {
        Self {
            lesson: lesson.clone(),
            start_time: lesson.start_time_or_default(),
            size: lesson.size(),
            days_remaining: days_until(lesson.date, today),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ParticipantStats {
    pub participant: Participant,
    pub done_count: usize,
    pub remaining_count: usize,
    pub total_scheduled: usize,
    pub progress_percent: u32,
    pub next_lesson: Option<NextLesson>,
    pub actual_price_per_lesson: f64,
    pub theoretical_price_per_lesson: f64,
    pub done_by_size: SizeBreakdown,
    pub upcoming_by_size: SizeBreakdown,
}

pub fn progress_percent(done: usize, total: usize) -> u32 {
    if total == 0 {
        0
    } else {
        (100.0 * done as f64 / total as f64).round() as u32
    }
}
pub fn price_per_lesson(amount_paid: f64, lessons: i64) -> f64 {
    if lessons > 0 {
        amount_paid / lessons as f64
    } else {
        0.0
    }
}

/// Derives one participant's figures from the full lesson list.
///
/// Ties for the next lesson go to the earliest start time, then the lowest lesson id.
pub fn participant_stats(participant: &Participant, lessons: &[Lesson], planned_lessons: i64, today: NaiveDate) -> ParticipantStats {
    let mut done_by_size = SizeBreakdown::default();
    let mut upcoming_by_size = SizeBreakdown::default();
    let mut done_count = 0;
    let mut remaining_count = 0;
    let mut next: Option<&Lesson> = None;
    for lesson in lessons.iter().filter(|l| l.is_attended_by(participant.id)) {
        let size = lesson.size();
        match classify(lesson.date, today) {
            LessonStatus::Done => {
                done_count += 1;
                if let Some(size) = size { done_by_size.count(size) }
            }
            LessonStatus::Upcoming => {
                remaining_count += 1;
                if let Some(size) = size { upcoming_by_size.count(size) }
                let key = |l: &Lesson| (l.date, l.start_time_or_default(), l.id);
                if next.is_none_or(|n| key(lesson) < key(n)) {
                    next = Some(lesson);
                }
            }
        }
    }
    let total_scheduled = done_count + remaining_count;
    ParticipantStats {
        participant: participant.clone(),
        done_count,
        remaining_count,
        total_scheduled,
        progress_percent: progress_percent(done_count, total_scheduled),
        next_lesson: next.map(|lesson| NextLesson::new(lesson, today)),
        actual_price_per_lesson: price_per_lesson(participant.amount_paid, total_scheduled as i64),
        theoretical_price_per_lesson: price_per_lesson(participant.amount_paid, planned_lessons),
        done_by_size,
        upcoming_by_size,
    }
}

/// Statistics for every participant, soonest next lesson first.
/// Participants without an upcoming lesson keep their order at the end.
pub fn compute_participant_stats(participants: &[Participant], lessons: &[Lesson], course: Option<&Course>, today: NaiveDate) -> Vec<ParticipantStats> {
    let planned_lessons = planned_lessons_or_default(course);
    let mut stats = participants.iter()
        .map(|p| participant_stats(p, lessons, planned_lessons, today))
        .collect::<Vec<_>>();
    stats.sort_by_key(|s| match &s.next_lesson {
        Some(next) => (false, Some(next.lesson.date)),
        None => (true, None),
    });
    stats
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct CourseSummary {
    pub course: Option<Course>,
    pub enrolled: usize,
    pub total_paid: f64,
    pub course_price: f64,
    pub planned_lessons: Option<i64>,
    pub price_per_planned_lesson: f64,
    pub next_lesson: Option<NextLesson>,
}

/// Dashboard figures. The next lesson here is the first one not before today,
/// so a lesson held today is still shown as next.
pub fn course_summary(course: Option<&Course>, participants: &[Participant], lessons: &[Lesson], today: NaiveDate) -> CourseSummary {
    let next_lesson = lessons.iter()
        .filter(|l| l.date >= today)
        .min_by_key(|l| (l.date, l.start_time_or_default(), l.id))
        .map(|lesson| NextLesson::new(lesson, today));
    let course_price = course.map(|c| c.price).unwrap_or_default();
    CourseSummary {
        course: course.cloned(),
        enrolled: participants.len(),
        total_paid: participants.iter().map(|p| p.amount_paid).sum(),
        course_price,
        planned_lessons: course.and_then(|c| c.planned_lessons),
        price_per_planned_lesson: price_per_lesson(course_price, planned_lessons_or_default(course)),
        next_lesson,
    }
}

async fn load_all(db: &State<DbPool>) -> Result<(Option<Course>, Vec<Participant>, Vec<Lesson>), Custom<String>> {
    let pool = &db.0;
    rocket::tokio::try_join!(
        load_course(pool),
        list_participants(pool),
        list_lessons(pool),
    ).map_err(status_sqlx_error)
}

#[get("/lessons")]
async fn get_lessons_status(user: UserSession, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let (course, participants, lessons) = load_all(db).await?;
    let stats = compute_participant_stats(&participants, &lessons, course.as_ref(), today());
    Ok(Template::render("lessons", context! {
        user: user.user_info,
        course,
        stats,
    }))
}
#[get("/api/stats/participants")]
async fn get_api_participant_stats(_user: UserSession, db: &State<DbPool>) -> Result<Json<Vec<ParticipantStats>>, Custom<String>> {
    let (course, participants, lessons) = load_all(db).await?;
    Ok(Json(compute_participant_stats(&participants, &lessons, course.as_ref(), today())))
}
#[get("/api/stats/course")]
async fn get_api_course_summary(_user: UserSession, db: &State<DbPool>) -> Result<Json<CourseSummary>, Custom<String>> {
    let (course, participants, lessons) = load_all(db).await?;
    Ok(Json(course_summary(course.as_ref(), &participants, &lessons, today())))
}

pub(crate) async fn load_course_summary(db: &State<DbPool>) -> Result<(CourseSummary, Vec<Participant>), Custom<String>> {
    let (course, participants, lessons) = load_all(db).await?;
    let summary = course_summary(course.as_ref(), &participants, &lessons, today());
    Ok((summary, participants))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_lessons_status,
            get_api_participant_stats,
            get_api_course_summary,
        ])
}
