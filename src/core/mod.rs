pub mod event_bus;
pub mod execution_context;
pub mod result_store;
pub mod runtime_context;
pub mod throttle;

pub use event_bus::{create_event_channel, EventEmitter, EventReceiver, EventSender, WorkflowEvent};
pub use execution_context::{ExecutionContext, ExecutionRecord, ExecutionType};
pub use result_store::ResultStore;
pub use runtime_context::{
    FakeIdGenerator, FakeTimeProvider, IdGenerator, RealIdGenerator, RealTimeProvider,
    RuntimeContext, TimeProvider,
};
pub use throttle::ThrottleManager;
