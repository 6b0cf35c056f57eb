pub mod call;
pub mod functions;
pub mod progress;

pub use call::{
    CallCommand, CallEvent, Gather, PromptEvent, PromptReason, Recognizer, Say, SpeechAlternative,
    SpeechResult, Verb,
};
pub use functions::{FunctionCall, FunctionResult, FunctionSet, FunctionSpec};
pub use progress::{InboundMessage, ProgressEvent, ProgressMessage};
