pub mod action;
pub mod agent;
pub mod analyze;
pub mod browser;
pub mod conversation;
pub mod cua;
pub mod dispatch;
pub mod operator;
pub mod screen;
pub mod session;

pub use action::{Action, ActionKind, ActionVocabulary, MouseButton, Proposed, SafetyCheck, ScrollDirection};
pub use agent::{
    Agent, AgentConfig, AgentError, AutoAcknowledge, LoopState, NeverAcknowledge, RunReport, SafetyPolicy, StopHandle,
};
pub use analyze::{SessionAnalyzer, SessionReport};
pub use browser::{Browser, BrowserConfig};
pub use conversation::{Conversation, Message};
pub use cua::{ModelClient, ModelError, Proposal, ResponsesClient, ResponsesConfig};
pub use dispatch::{ActionDispatcher, ErrorKind, InputDriver, InputError, Outcome};
pub use operator::{Decision, Operator, StdinOperator};
pub use screen::{CaptureError, EncodedImage, ImageFormat, ScreenCapture};
pub use session::{
    DiskScreenshotStore, JsonFileRecorder, MemoryRecorder, Session, SessionRecorder, Summary, Termination, Turn,
};
