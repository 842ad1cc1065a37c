pub(crate) mod report;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use reqwest::{Client, Method, StatusCode, Url};
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PortalConfig;
pub use report::RawReport;

const BASE_URL: &str = "https://apsystemsema.com";
const LOGIN_PATH: &str = "/ema/index.action";
const REPORT_PATH: &str = "/ema/ajax/getReportApiAjax/getPowerOnCurrentDayAjax";
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 6.1; WOW64; rv:52.0) Gecko/20100101 Firefox/52.0";

static FORM: Lazy<Selector> = Lazy::new(|| Selector::parse("form").expect("valid selector"));
static INPUT: Lazy<Selector> = Lazy::new(|| Selector::parse("input").expect("valid selector"));

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Login page has no form")]
    LoginFormMissing,
    #[error("Login form has no `{0}` field")]
    LoginFieldMissing(&'static str),
    #[error("Not authenticated; log in before fetching reports")]
    NotAuthenticated,
    #[error("Malformed report for {day}: {reason}")]
    MalformedReport { day: NaiveDate, reason: String },
}

#[derive(Debug, Clone)]
pub struct PortalEndpoints {
    pub login: String,
    pub report: String,
}

impl PortalEndpoints {
    pub fn with_base_url(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            login: format!("{}{}", base, LOGIN_PATH),
            report: format!("{}{}", base, REPORT_PATH),
        }
    }
}

impl Default for PortalEndpoints {
    fn default() -> Self {
        Self::with_base_url(BASE_URL)
    }
}

/// Authenticated handle; the client's cookie store carries the login.
pub struct Session {
    client: Client,
}

pub enum SessionState {
    Unauthenticated,
    Authenticated(Session),
}

/// Result of asking the portal for one day.
#[derive(Debug, Clone)]
pub enum DayReport {
    /// The portal answered 204.
    NoData,
    Data(RawReport),
}

/// Anything that can produce the daily report for a given day.
pub trait ReportSource {
    async fn fetch(&self, day: NaiveDate) -> Result<DayReport, PortalError>;
}

pub struct ApSystemsClient {
    endpoints: PortalEndpoints,
    username: String,
    password: String,
    system_id: String,
    ecu_id: String,
    state: SessionState,
}

impl ApSystemsClient {
    pub fn new(endpoints: PortalEndpoints, portal: &PortalConfig) -> Self {
        Self {
            endpoints,
            username: portal.username.clone(),
            password: portal.password.clone(),
            system_id: portal.system_id.clone(),
            ecu_id: portal.ecu_id.clone(),
            state: SessionState::Unauthenticated,
        }
    }

    /// Submit the first form of the login page with the credentials filled in.
    ///
    /// The portal gives no reliable success signal, so a rejected login still
    /// yields a session; the report request is where it shows.
    pub async fn login(&mut self) -> Result<(), PortalError> {
        let client = Client::builder()
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .build()?;

        let page = client
            .get(&self.endpoints.login)
            .send()
            .await?
            .error_for_status()?;
        let page_url = page.url().clone();
        let html = page.text().await?;

        let mut form = LoginForm::parse(&html, &page_url)?;
        form.set("username", &self.username)?;
        form.set("password", &self.password)?;

        let response = form.submit(&client).await?;
        let status = response.status();
        if status.is_success() {
            info!(user = %self.username, "logged in to APsystems portal");
        } else {
            warn!(%status, "login form submission returned a non-success status");
        }

        self.state = SessionState::Authenticated(Session { client });
        Ok(())
    }

    /// Fetch the power/energy report for one day.
    pub async fn fetch_day(&self, day: NaiveDate) -> Result<DayReport, PortalError> {
        let SessionState::Authenticated(session) = &self.state else {
            return Err(PortalError::NotAuthenticated);
        };

        let query_date = day.format("%Y%m%d").to_string();
        let params = [
            ("queryDate", query_date.as_str()),
            ("selectedValue", self.ecu_id.as_str()),
            ("systemId", self.system_id.as_str()),
        ];

        let response = session
            .client
            .post(&self.endpoints.report)
            .form(&params)
            .send()
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            warn!(%day, "portal returned 204, no data for this day");
            return Ok(DayReport::NoData);
        }

        let status = response.status();
        let body = response.text().await?;
        let report: RawReport =
            serde_json::from_str(&body).map_err(|e| PortalError::MalformedReport {
                day,
                reason: format!("status {}: {}", status, e),
            })?;

        info!(%day, samples = report.len(), "fetched daily report");
        Ok(DayReport::Data(report))
    }
}

impl ReportSource for ApSystemsClient {
    async fn fetch(&self, day: NaiveDate) -> Result<DayReport, PortalError> {
        self.fetch_day(day).await
    }
}

/// Controls of an HTML form, ready to be submitted the way a browser would.
#[derive(Debug)]
struct LoginForm {
    action: Url,
    method: Method,
    fields: Vec<(String, String)>,
}

impl LoginForm {
    fn parse(html: &str, page_url: &Url) -> Result<Self, PortalError> {
        let document = Html::parse_document(html);
        let form = document
            .select(&FORM)
            .next()
            .ok_or(PortalError::LoginFormMissing)?;

        let action = match form.value().attr("action").map(str::trim) {
            Some(action) if !action.is_empty() => page_url
                .join(action)
                .map_err(|e| PortalError::InvalidUrl(format!("{}: {}", action, e)))?,
            _ => page_url.clone(),
        };

        let method = match form.value().attr("method") {
            Some(m) if m.eq_ignore_ascii_case("get") => Method::GET,
            _ => Method::POST,
        };

        let mut fields = Vec::new();
        let mut submit_seen = false;
        for input in form.select(&INPUT) {
            let el = input.value();
            let Some(name) = el.attr("name") else {
                continue;
            };
            let kind = el.attr("type").unwrap_or("text").to_ascii_lowercase();
            match kind.as_str() {
                "button" | "reset" | "file" | "image" => continue,
                // Only the first submit button counts as clicked.
                "submit" => {
                    if submit_seen {
                        continue;
                    }
                    submit_seen = true;
                }
                "checkbox" | "radio" if el.attr("checked").is_none() => continue,
                _ => {}
            }
            fields.push((
                name.to_string(),
                el.attr("value").unwrap_or_default().to_string(),
            ));
        }

        debug!(%action, %method, controls = fields.len(), "parsed login form");
        Ok(Self {
            action,
            method,
            fields,
        })
    }

    fn set(&mut self, name: &'static str, value: &str) -> Result<(), PortalError> {
        let field = self
            .fields
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or(PortalError::LoginFieldMissing(name))?;
        field.1 = value.to_string();
        Ok(())
    }

    async fn submit(self, client: &Client) -> Result<reqwest::Response, PortalError> {
        let request = if self.method == Method::GET {
            let mut url = self.action;
            url.query_pairs_mut().extend_pairs(&self.fields);
            client.get(url)
        } else {
            client.post(self.action).form(&self.fields)
        };
        Ok(request.send().await?)
    }
}
