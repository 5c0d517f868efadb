use serde_json::Value;

use super::step_executor::execute_step;
use super::{Control, RunEnv};
use crate::domain::execution::{StepResult, StepScope};
use crate::domain::model::RouteDeclaration;
use crate::error::StepError;

/// Classifies once and runs exactly one arm, recorded under the route's name.
pub(crate) async fn run_route(
    env: &RunEnv,
    route: &RouteDeclaration,
    scope: &StepScope,
) -> (StepResult, Control) {
    let key = match (route.classifier)(scope) {
        Ok(key) => key,
        Err(error) => return unrouted(env, route, scope, error),
    };
    let Some(arm) = route.select(&key) else {
        return unrouted(env, route, scope, StepError::NoRoute(key));
    };

    tracing::debug!(
        execution_id = %env.execution_id,
        route = %route.name(),
        classification = %key,
        arm = %arm.key(),
        "route selected"
    );
    let declaration = arm.to_declaration(route.name());
    let (result, control) = execute_step(env, &declaration, scope).await;
    let result = result
        .with_metadata("classification", Value::String(key))
        .with_metadata("arm", Value::String(arm.key().to_string()));
    (result, control)
}

fn unrouted(
    env: &RunEnv,
    route: &RouteDeclaration,
    scope: &StepScope,
    error: StepError,
) -> (StepResult, Control) {
    tracing::error!(
        execution_id = %env.execution_id,
        route = %route.name(),
        error = %error,
        "route could not be resolved"
    );
    let result = StepResult::failed(route.name(), &error, Value::Null);
    env.step_finished(scope, &result);
    (result, Control::Abort(error))
}
