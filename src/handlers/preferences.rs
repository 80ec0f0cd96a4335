use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::{change_request_not_found, connection, employee, parse_body, ChangeHandler, HandlerRequest, Services};
use crate::classify::{ClassifiedItem, Route};
use crate::gateway::AvailabilityModel;
use crate::model::{ChangeOutcome, HttpMethod, ShiftPreferenceBody};

/// `PUT /users/{userId}/settings/shiftPreferences`: push the user's
/// availability to the WFM side.
pub struct UpdateShiftPreferences;

#[async_trait]
impl ChangeHandler for UpdateShiftPreferences {
    fn name(&self) -> &'static str {
        "update_shift_preferences"
    }

    fn can_handle(&self, items: &[ClassifiedItem<'_>]) -> Option<usize> {
        items.iter().position(|i| {
            matches!(i.route, Route::ShiftPreferences { .. })
                && matches!(i.method(), HttpMethod::Put | HttpMethod::Patch)
        })
    }

    #[instrument(skip_all, fields(team_id = request.team_id))]
    async fn handle(&self, services: &Services, request: &HandlerRequest<'_>) -> Result<ChangeOutcome> {
        let Route::ShiftPreferences { user_id } = &request.matched.route else {
            return Ok(change_request_not_found(&request.matched.item.id));
        };
        let Some(body) = parse_body::<ShiftPreferenceBody>(request.matched) else {
            return Ok(change_request_not_found(&request.matched.item.id));
        };
        let employee = resolve!(employee(services, user_id).await?);
        let connection = resolve!(connection(services, request.team_id).await?);

        let model = AvailabilityModel {
            bu_id: connection.wfm_bu_id,
            time_zone_id: connection.time_zone_id,
            employee,
            availability: body.availability,
        };
        let result = services.wfm.update_employee_availability(&model).await?;
        if result.success {
            info!(user_id = %user_id, "availability updated");
        } else {
            warn!(user_id = %user_id, code = ?result.error_code, "WFM rejected availability update");
        }
        Ok(ChangeOutcome::from(&result.to_cached()))
    }
}
