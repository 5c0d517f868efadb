use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use stepwise::infrastructure::InMemoryExecutionSink;
use stepwise::{
    sync_unit, Agent, ExecutionContext, FlowEngine, ParallelBuilder, Pipeline, PipelineConfig,
    RetryPolicy, RouteArm, RouteBuilder, StepBuilder, StepError, StepOutcome, UnitOutput, Usage,
    WorkflowDefinition, WorkflowStatus, Worker,
};

/// Pretends to be a model: scores the text by length.
struct ReviewWorker;

#[async_trait::async_trait]
impl Worker for ReviewWorker {
    async fn perform(&self, ctx: &ExecutionContext) -> Result<UnitOutput, StepError> {
        let text = ctx.input["text"].as_str().unwrap_or_default();
        let score = (text.len() as f64 / 10.0).min(10.0);
        Ok(UnitOutput::new(json!({ "model": ctx.model, "score": score }))
            .with_usage(Usage::new(text.len() as u64, 12, 0.002)))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== Stepwise demo: document review ===\n");

    let sink = Arc::new(InMemoryExecutionSink::new());
    let pipeline = Pipeline::standard(PipelineConfig {
        sink: sink.clone(),
        ..PipelineConfig::default()
    });
    let reviewer: Arc<Agent> = Arc::new(
        Agent::builder("reviewer", Arc::new(ReviewWorker))
            .model("review-small")
            .pipeline(pipeline)
            .build(),
    );

    let workflow = match build_workflow(reviewer) {
        Ok(workflow) => workflow,
        Err(e) => {
            eprintln!("invalid workflow: {}", e);
            std::process::exit(1);
        }
    };

    let engine = FlowEngine::new();
    let input = json!({
        "text": "Stepwise runs declarative workflows with retries, routes and approvals.",
        "tenant_id": "acme",
    });
    let result = engine.run(&workflow, input).await;

    println!("status: {}", result.status);
    println!("steps:  {:?}", result.step_names());
    println!("cost:   {:.4}", result.total_cost);
    println!("agent attempts recorded: {}", sink.len());
    match serde_json::to_string_pretty(&result) {
        Ok(trace) => println!("\n{}", trace),
        Err(e) => eprintln!("failed to serialize trace: {}", e),
    }
    if result.status != WorkflowStatus::Success {
        std::process::exit(1);
    }
}

fn build_workflow(
    reviewer: Arc<Agent>,
) -> Result<Arc<WorkflowDefinition>, stepwise::WorkflowError> {
    let normalize = sync_unit("normalize", |input| {
        let text = input["text"].as_str().unwrap_or_default();
        Ok(json!({ "text": text.trim(), "words": text.split_whitespace().count() }))
    });
    let grammar = sync_unit("grammar", |_| {
        Err(StepError::unit("unavailable", "grammar service is offline"))
    });
    let escalate = sync_unit("escalate", |input| Ok(json!({ "escalated": input })));
    let publish = sync_unit("publish", |input| Ok(json!({ "published": input })));

    WorkflowDefinition::builder("document-review")
        .timeout(Duration::from_secs(30))
        .step(StepBuilder::new("normalize", normalize))
        .parallel(
            ParallelBuilder::new("checks")
                .step(
                    StepBuilder::new("review", reviewer as Arc<dyn stepwise::UnitOfWork>)
                        .input(|scope| scope.output("normalize").cloned())
                        .retry(RetryPolicy::new(2).retry_on(["unavailable"]))
                        .timeout(Duration::from_secs(5)),
                )
                .step(StepBuilder::new("grammar", grammar).optional(json!({ "issues": [] }))),
        )
        .route(
            RouteBuilder::new("decide", |scope| {
                let score = scope
                    .output("checks")?
                    .pointer("/review/score")
                    .and_then(Value::as_f64)
                    .unwrap_or_default();
                Ok(if score >= 5.0 { "publish" } else { "escalate" }.to_string())
            })
            .route("publish", publish)
            .default_route(RouteArm::new("escalate", escalate)),
        )
        .step(StepBuilder::new(
            "summary",
            stepwise::StepTarget::block(|scope, _| {
                let decision = scope.output("decide")?.clone();
                Ok(StepOutcome::Continue(json!({ "decision": decision })))
            }),
        ))
        .build()
}
