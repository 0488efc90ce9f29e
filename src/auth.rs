use anyhow::{anyhow, Context};
use rand::Rng;
use reqwest::header::AUTHORIZATION;
use rocket::{request, Build, Request, Rocket, State};
use rocket::http::{Cookie, CookieJar, SameSite, Status};
use rocket::response::{Debug, Redirect};
use rocket_dyn_templates::{context, Template};
use rocket_oauth2::{OAuth2, TokenResponse};
use serde::Serialize;
use serde_json::Value;
use crate::{AppConfig, Session, SessionId, SharedCourseState};

pub const SESSION_ID: &str = "tc_session_id";

#[derive(Clone, Serialize, Debug)]
pub struct UserInfo {
    pub name: String,
    pub email: String,
    pub picture: String,
}
impl TryFrom<&GoogleUserInfo> for UserInfo {
    type Error = anyhow::Error;

    fn try_from(info: &GoogleUserInfo) -> Result<Self, Self::Error> {
        fn to_string(val: &Value) -> String {
            val.as_str().map(|s| s.to_string()).unwrap_or_default()
        }
        let email = to_string(&info.email);
        if email.is_empty() {
            return Err(anyhow!("User email must be set"));
        };
        Ok(Self {
            name: to_string(&info.name),
            email,
            picture: to_string(&info.picture),
        })
    }
}

/// Signed-in user, resolved from the private session cookie.
///
/// Without a live session the guard forwards with 401, which ends up in the
/// login-required catcher when no other route matches.
pub struct UserSession {
    pub session_id: SessionId,
    pub user_info: UserInfo,
}
#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for UserSession {
    type Error = ();
    async fn from_request(request: &'r Request<'_>) -> request::Outcome<UserSession, ()> {
        let Some(cookie) = request.cookies().get_private(SESSION_ID) else {
            return request::Outcome::Forward(Status::Unauthorized);
        };
        let session_id = SessionId(cookie.value().to_string());
        let Some(state) = request.rocket().state::<SharedCourseState>() else {
            return request::Outcome::Error((Status::InternalServerError, ()));
        };
        match user_info(&session_id, state) {
            Ok(user_info) => request::Outcome::Success(UserSession { session_id, user_info }),
            Err(e) => {
                debug!("Session rejected: {e}");
                request::Outcome::Forward(Status::Unauthorized)
            }
        }
    }
}

pub fn user_info(session_id: &SessionId, state: &SharedCourseState) -> Result<UserInfo, String> {
    state.read().map_err(|e| e.to_string())?
        .sessions.get(session_id).map(|s| s.user_info.clone()).ok_or("Session expired".to_string())
}
pub fn open_session(user_info: UserInfo, state: &SharedCourseState) -> anyhow::Result<SessionId> {
    let session_id = SessionId(generate_random_string(32));
    state.write().map_err(|e| anyhow!("{e}"))?
        .sessions.insert(session_id.clone(), Session { user_info });
    Ok(session_id)
}

pub fn generate_random_string(len: usize) -> String {
    const VOWELS: &[u8] = b"aeiouy";
    const CONSONANTS: &[u8] = b"bcdfghjklmnpqrstvwxz";
    let mut rng = rand::rng();
    (0..len)
        .map(|n| {
            let charset = if n % 2 == 0 { CONSONANTS } else { VOWELS };
            charset[rng.random_range(0..charset.len())] as char
        })
        .collect()
}

/// User information to be retrieved from the Google People API.
#[derive(serde::Deserialize)]
pub struct GoogleUserInfo {
    name: Value,
    email: Value,
    picture: Value,
}

#[get("/login")]
fn login(cfg: &State<AppConfig>) -> Template {
    Template::render("login", context! {
        google_login_url: cfg.google_login_url(),
    })
}

#[get("/login/google")]
fn google_login(oauth2: OAuth2<GoogleUserInfo>, cookies: &CookieJar<'_>) -> Result<Redirect, Status> {
    oauth2.get_redirect(cookies, &["profile", "email"])
        .map_err(|e| {
            error!("OAuth2 redirect error: {e}");
            Status::InternalServerError
        })
}

#[get("/auth/google")]
async fn google_auth(token: TokenResponse<GoogleUserInfo>, cookies: &CookieJar<'_>, state: &State<SharedCourseState>) -> Result<Redirect, Debug<anyhow::Error>> {
    let response = reqwest::Client::builder()
        .build()
        .context("failed to build reqwest client")?
        .get("https://www.googleapis.com/oauth2/v2/userinfo")
        .header(AUTHORIZATION, format!("Bearer {}", token.access_token()))
        .send()
        .await
        .context("failed to complete request")?;
    let google_user_info: GoogleUserInfo = response
        .json()
        .await
        .context("failed to deserialize response")?;
    let user_info = UserInfo::try_from(&google_user_info)?;
    info!("User log in, name: {}, email: {}", user_info.name, user_info.email);
    let session_id = open_session(user_info, state)?;
    cookies.add_private(
        Cookie::build((SESSION_ID, session_id.0))
            .same_site(SameSite::Lax)
            .build()
    );
    Ok(Redirect::to("/"))
}

#[get("/logout")]
fn logout(user: UserSession, cookies: &CookieJar<'_>, state: &State<SharedCourseState>) -> Redirect {
    if let Ok(mut state) = state.write() {
        state.sessions.remove(&user.session_id);
    }
    cookies.remove_private(SESSION_ID);
    info!("User log out, email: {}", user.user_info.email);
    Redirect::to("/login")
}

#[catch(401)]
fn login_required() -> Template {
    Template::render("login-required", context! {})
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            login,
            google_login,
            google_auth,
            logout,
        ])
        .register("/", catchers![login_required])
        .attach(OAuth2::<GoogleUserInfo>::fairing("google"))
}

#[test]
fn test_generate_random_string() {
    let s = generate_random_string(32);
    assert_eq!(s.len(), 32);
    assert!(s.chars().all(|c| c.is_ascii_lowercase()));
    assert_ne!(s, generate_random_string(32));
}

#[test]
fn test_user_info_requires_email() {
    let info = GoogleUserInfo {
        name: Value::from("Anna"),
        email: Value::Null,
        picture: Value::Null,
    };
    assert!(UserInfo::try_from(&info).is_err());
    let info = GoogleUserInfo {
        name: Value::from("Anna"),
        email: Value::from("anna@example.com"),
        picture: Value::Null,
    };
    let user = UserInfo::try_from(&info).unwrap();
    assert_eq!(user.email, "anna@example.com");
    assert_eq!(user.picture, "");
}
