#[macro_use] extern crate rocket;

use std::collections::HashMap;
use std::sync::RwLock;
use rocket::fs::FileServer;
use rocket::response::status::Custom;
use rocket::State;
use rocket_dyn_templates::{Template, context, handlebars};
use rocket_dyn_templates::handlebars::{Handlebars, Helper};
use serde::Deserialize;
use crate::auth::{UserInfo, UserSession};
use crate::db::{DbPool, DbPoolFairing};
use crate::coursedate::datestr;
use crate::util::format_price;

mod db;
mod auth;
mod util;
mod coursedate;
mod course;
mod participant;
mod lesson;
mod stats;
mod calendar;

#[derive(Deserialize, Debug)]
struct AppConfig {
    #[serde(default = "AppConfig::default_server_address")]
    server_address: String,
    #[serde(default)]
    public_url: Option<String>,
}
impl AppConfig {
    fn default_server_address() -> String {
        "127.0.0.1".to_string()
    }
    /// Must be the same host as the OAuth redirect_uri, otherwise the state cookie check fails.
    fn google_login_url(&self) -> String {
        if self.server_address == "127.0.0.1" {
            "http://localhost:8000/login/google".to_string()
        } else if let Some(public_url) = &self.public_url {
            format!("{}/login/google", public_url.trim_end_matches('/'))
        } else {
            "/login/google".to_string()
        }
    }
}
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_address: Self::default_server_address(),
            public_url: None,
        }
    }
}

struct Session {
    user_info: UserInfo,
}
#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub struct SessionId(pub String);

#[derive(Default)]
struct CourseState {
    sessions: HashMap<SessionId, Session>,
}
type SharedCourseState = RwLock<CourseState>;

#[get("/")]
async fn index(user: UserSession, db: &State<DbPool>) -> Result<Template, Custom<String>> {
    let (summary, participants) = stats::load_course_summary(db).await?;
    Ok(Template::render("index", context! {
        user: user.user_info,
        course: summary.course.clone().unwrap_or_default(),
        summary,
        participants,
    }))
}

fn register_helpers(handlebars: &mut Handlebars<'static>) {
    handlebars.register_helper("price",
                               Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                   let val = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("price", 0))?.value();
                                   let s = format_price(val.as_f64().unwrap_or_default());
                                   out.write(&s)?;
                                   Ok(())
                               }));
    handlebars.register_helper("datestr",
                               Box::new(|h: &Helper, _r: &Handlebars, _: &handlebars::Context, _rc: &mut handlebars::RenderContext, out: &mut dyn handlebars::Output| -> handlebars::HelperResult {
                                   let val = h.param(0).ok_or(handlebars::RenderErrorReason::ParamNotFoundForIndex("datestr", 0))?.value();
                                   out.write(&datestr(val.as_str()))?;
                                   Ok(())
                               }));
}

#[launch]
fn rocket() -> _ {
    let rocket = rocket::build()
        .attach(Template::custom(|engines| register_helpers(&mut engines.handlebars)))
        .attach(DbPoolFairing())
        .mount("/static", FileServer::from("./static"))
        .mount("/", routes![
            index,
        ]);
    let rocket = auth::extend(rocket);
    let rocket = course::extend(rocket);
    let rocket = participant::extend(rocket);
    let rocket = lesson::extend(rocket);
    let rocket = stats::extend(rocket);
    let rocket = calendar::extend(rocket);

    let cfg = rocket.figment().extract::<AppConfig>().unwrap_or_else(|e| {
        warn!("Application config error: {e}, using defaults");
        AppConfig::default()
    });
    info!("Server address: {}", cfg.server_address);
    let rocket = rocket.manage(cfg);

    rocket.manage(SharedCourseState::new(CourseState::default()))
}
