/*!
 # Remote configuration

 A small form-based HTTP interface:

 * `GET /` serves the configuration form, prefilled with the live schedule
 * `GET /time` serves the status page
 * `POST /time` submits a new schedule, guarded by the gatekeeper password
 * `GET`/`POST /debug` writes raw PWM duty to the outputs, only when enabled

 Every other path answers `404: Not found`.
*/

use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{error, info, instrument, warn};

use crate::clock::Clock;
use crate::controller::{ScheduleController, Status};
use crate::output::{OutputDriver, PWM_MAX};
use crate::schedule::{fields, Channel, DayClass, ScheduleRequest, ScheduleState, Window};
use crate::store::Store;

/// Form field carrying the password
pub const GATEKEEPER_FIELD: &str = "gatekeeper";

/// Debug form fields carrying raw duty per output
pub const DEBUG_FIELDS: [(&str, Channel); 2] =
    [("dayPin", Channel::Day), ("nightPin", Channel::Night)];

/// Shared state of the HTTP handlers
pub struct AppState<C, S, D> {
    pub controller: Arc<Mutex<ScheduleController<C, S, D>>>,
    pub gatekeeper: Arc<str>,
    pub debug_page: bool,
}

impl<C, S, D> AppState<C, S, D> {
    pub fn new(controller: Arc<Mutex<ScheduleController<C, S, D>>>, gatekeeper: &str) -> Self {
        Self {
            controller,
            gatekeeper: Arc::from(gatekeeper),
            debug_page: false,
        }
    }

    pub fn with_debug_page(mut self, enabled: bool) -> Self {
        self.debug_page = enabled;
        self
    }

    /// Empty configured passwords never match
    fn admits(&self, password: &str) -> bool {
        !self.gatekeeper.is_empty()
            && bool::from(password.as_bytes().ct_eq(self.gatekeeper.as_bytes()))
    }
}

impl<C, S, D> Clone for AppState<C, S, D> {
    fn clone(&self) -> Self {
        Self {
            controller: Arc::clone(&self.controller),
            gatekeeper: Arc::clone(&self.gatekeeper),
            debug_page: self.debug_page,
        }
    }
}

/// Builds the configuration router
pub fn router<C, S, D>(state: AppState<C, S, D>) -> Router
where
    C: Clock + Send + 'static,
    S: Store + Send + 'static,
    D: OutputDriver + Send + 'static,
{
    let mut app = Router::new()
        .route("/", get(form_page::<C, S, D>))
        .route("/time", get(status_page::<C, S, D>).post(submit::<C, S, D>));
    if state.debug_page {
        app = app.route("/debug", get(debug_page).post(debug_submit::<C, S, D>));
    }
    app.fallback(not_found).with_state(state)
}

async fn form_page<C, S, D>(State(state): State<AppState<C, S, D>>) -> Html<String>
where
    C: Clock,
    S: Store,
    D: OutputDriver,
{
    let schedule = state.controller.lock().state().clone();
    Html(render_form(&schedule))
}

async fn status_page<C, S, D>(State(state): State<AppState<C, S, D>>) -> Html<String>
where
    C: Clock,
    S: Store,
    D: OutputDriver,
{
    let status = state.controller.lock().status();
    Html(render_status(&status))
}

#[instrument(skip_all)]
async fn submit<C, S, D>(
    State(state): State<AppState<C, S, D>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response
where
    C: Clock,
    S: Store,
    D: OutputDriver,
{
    let Some(password) = form.get(GATEKEEPER_FIELD).filter(|p| !p.is_empty()) else {
        warn!("Schedule submission without gatekeeper");
        return (StatusCode::BAD_REQUEST, "400: Invalid Request").into_response();
    };
    if !state.admits(password) {
        warn!("Schedule submission with wrong gatekeeper");
        return (StatusCode::UNAUTHORIZED, "401: Unauthorized").into_response();
    }

    let request = match ScheduleRequest::from_form(&form) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected schedule submission: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                format!("400: Invalid Request ({})", e),
            )
                .into_response();
        }
    };

    let status = {
        let mut controller = state.controller.lock();
        controller.set_schedule(&request);
        if !controller.persist() {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "500: Schedule is active but could not be saved",
            )
                .into_response();
        }
        controller.status()
    };
    info!("Schedule updated over HTTP");
    Html(render_status(&status)).into_response()
}

async fn debug_page() -> Html<String> {
    Html(render_debug(&[None, None]))
}

/// Writes the submitted duties. A value outside 1-1023 turns the output off,
/// a missing or empty field leaves it untouched.
#[instrument(skip_all)]
async fn debug_submit<C, S, D>(
    State(state): State<AppState<C, S, D>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response
where
    C: Clock,
    S: Store,
    D: OutputDriver,
{
    let mut written = [None, None];
    {
        let mut controller = state.controller.lock();
        for (slot, (name, channel)) in DEBUG_FIELDS.into_iter().enumerate() {
            let Some(value) = form.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) else {
                continue;
            };
            let duty = value
                .parse::<u16>()
                .ok()
                .filter(|d| (1..=PWM_MAX).contains(d))
                .unwrap_or(0);
            if let Err(e) = controller.drive_raw(channel, duty) {
                error!("Debug write failed: {}", e);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("500: Output error ({})", e),
                )
                    .into_response();
            }
            written[slot] = Some(duty);
        }
    }
    Html(render_debug(&written)).into_response()
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "404: Not found")
}

fn time_input(out: &mut String, label: &str, name: &str, value: Option<String>) {
    let _ = writeln!(
        out,
        "<label>{label} <input type=\"time\" name=\"{name}\" value=\"{}\"></label><br>",
        value.unwrap_or_default()
    );
}

fn intensity_input(out: &mut String, label: &str, name: &str, value: Option<u8>) {
    let _ = writeln!(
        out,
        "<label>{label} <input type=\"number\" min=\"1\" max=\"100\" name=\"{name}\" value=\"{}\"></label><br>",
        value.map(|v| v.to_string()).unwrap_or_default()
    );
}

/// Raw duty form, prefilled with the last written values
pub fn render_debug(duties: &[Option<u16>; 2]) -> String {
    let mut out = String::from(
        "<!DOCTYPE html>\n<html><head><title>Nightlight debug</title></head><body>\n\
         <form method=\"post\" action=\"/debug\">\n",
    );
    for ((name, channel), duty) in DEBUG_FIELDS.into_iter().zip(duties) {
        let _ = writeln!(
            out,
            "<label>{} output duty (0-{PWM_MAX}) <input type=\"number\" min=\"0\" max=\"{PWM_MAX}\" name=\"{name}\" value=\"{}\"></label><br>",
            channel.name(),
            duty.map(|d| d.to_string()).unwrap_or_default()
        );
    }
    out.push_str("<input type=\"submit\" value=\"Write\">\n</form>\n</body></html>\n");
    out
}

/// Configuration form, prefilled when a schedule is installed
pub fn render_form(state: &ScheduleState) -> String {
    let live = state.initialized;
    let start = |w: Window| live.then(|| w.start.to_string());
    let end = |w: Window| live.then(|| w.end.to_string());
    let weekend_start = |w: Option<Window>| w.map(|w| w.start.to_string());
    let weekend_end = |w: Option<Window>| w.map(|w| w.end.to_string());
    let weekend_day = state.weekend.map(|w| w.day);
    let weekend_night = state.weekend.map(|w| w.night);

    let mut out = String::from(
        "<!DOCTYPE html>\n<html><head><title>Nightlight</title></head><body>\n\
         <h1>Schedule</h1>\n<form method=\"post\" action=\"/time\">\n",
    );
    out.push_str("<h2>Day</h2>\n");
    time_input(&mut out, "Start", fields::DAY_START, start(state.day));
    time_input(&mut out, "End", fields::DAY_END, end(state.day));
    intensity_input(&mut out, "Intensity", fields::DAY_INTENSITY, live.then_some(state.day_intensity));
    out.push_str("<h2>Night</h2>\n");
    time_input(&mut out, "Start", fields::NIGHT_START, start(state.night));
    time_input(&mut out, "End", fields::NIGHT_END, end(state.night));
    intensity_input(&mut out, "Intensity", fields::NIGHT_INTENSITY, live.then_some(state.night_intensity));
    out.push_str("<h2>Weekend (optional, Friday to Sunday)</h2>\n");
    time_input(&mut out, "Day start", fields::WEEKEND_DAY_START, weekend_start(weekend_day));
    time_input(&mut out, "Day end", fields::WEEKEND_DAY_END, weekend_end(weekend_day));
    time_input(&mut out, "Night start", fields::WEEKEND_NIGHT_START, weekend_start(weekend_night));
    time_input(&mut out, "Night end", fields::WEEKEND_NIGHT_END, weekend_end(weekend_night));
    let _ = writeln!(
        out,
        "<label>Daylight saving <input type=\"checkbox\" name=\"{}\"{}></label><br>",
        fields::DST,
        if state.dst_active { " checked" } else { "" }
    );
    let _ = writeln!(
        out,
        "<label>Password <input type=\"password\" name=\"{GATEKEEPER_FIELD}\"></label><br>"
    );
    out.push_str("<input type=\"submit\" value=\"Save\">\n</form>\n</body></html>\n");
    out
}

/// Status page: current time and the installed schedule
pub fn render_status(status: &Status) -> String {
    let state = &status.state;
    let mut out = String::from(
        "<!DOCTYPE html>\n<html><head><title>Nightlight</title></head><body>\n",
    );
    let _ = writeln!(
        out,
        "<p>{} {} ({})</p>",
        status.weekday,
        status.now.format("%H:%M"),
        match status.day_class {
            DayClass::Weekday => "weekday schedule",
            DayClass::Weekend => "weekend schedule",
        }
    );
    if !state.initialized {
        out.push_str("<p>No schedule configured.</p>\n");
    } else {
        let _ = writeln!(out, "<p>Day: {} at {}%</p>", state.day, state.day_intensity);
        let _ = writeln!(out, "<p>Night: {} at {}%</p>", state.night, state.night_intensity);
        if let Some(weekend) = &state.weekend {
            let _ = writeln!(
                out,
                "<p>Weekend day: {}, weekend night: {}</p>",
                weekend.day, weekend.night
            );
        }
        let _ = writeln!(
            out,
            "<p>Daylight saving: {}, saved: {}</p>",
            if state.dst_active { "on" } else { "off" },
            if state.persisted { "yes" } else { "no" }
        );
        let _ = writeln!(
            out,
            "<p>Outputs: day {}, night {} ({} alarms)</p>",
            if state.output.day_active { "on" } else { "off" },
            if state.output.night_active { "on" } else { "off" },
            status.live_alarms
        );
    }
    out.push_str("<p><a href=\"/\">Change schedule</a></p>\n</body></html>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::output::LogDriver;
    use crate::schedule::{TimeOfDay, WeekendOverride};
    use crate::store::MemoryStore;

    fn window(start: &str, end: &str) -> Window {
        Window::new(
            start.parse::<TimeOfDay>().unwrap(),
            end.parse::<TimeOfDay>().unwrap(),
        )
    }

    #[test]
    fn test_form_empty_until_configured() {
        let page = render_form(&ScheduleState::default());
        assert!(page.contains("name=\"dayStart\" value=\"\""));
        assert!(!page.contains(" checked"));
    }

    #[test]
    fn test_form_prefilled() {
        let state = ScheduleState {
            initialized: true,
            dst_active: true,
            day: window("08:00", "20:00"),
            night: window("20:00", "08:00"),
            weekend: Some(WeekendOverride {
                day: window("10:00", "22:00"),
                night: window("22:00", "10:00"),
            }),
            day_intensity: 80,
            night_intensity: 30,
            ..ScheduleState::default()
        };
        let page = render_form(&state);
        assert!(page.contains("name=\"dayStart\" value=\"08:00\""));
        assert!(page.contains("name=\"nightIntensity\" value=\"30\""));
        assert!(page.contains("name=\"weekendNightEnd\" value=\"10:00\""));
        assert!(page.contains(" checked"));
    }

    #[test]
    fn test_gatekeeper_matching() {
        let controller = Arc::new(Mutex::new(ScheduleController::new(
            SystemClock::new(0),
            MemoryStore::new(),
            LogDriver::new(),
            0,
        )));
        let state = AppState::new(Arc::clone(&controller), "secret");
        assert!(state.admits("secret"));
        assert!(!state.admits("secreT"));
        assert!(!state.admits("secret2"));
        assert!(!state.admits("secre"));

        let locked = AppState::new(controller, "");
        assert!(!locked.admits(""));
        assert!(!locked.admits("secret"));
    }

    #[test]
    fn test_debug_form() {
        let page = render_debug(&[Some(512), None]);
        assert!(page.contains("name=\"dayPin\" value=\"512\""));
        assert!(page.contains("name=\"nightPin\" value=\"\""));
    }
}
