//! JSON-RPC 2.0 wire format and channel, spec.md §4.1.

mod channel;
mod message;

pub use channel::{CallError, Channel, HandlerError, HandlerResult, RpcHandler};
pub use message::{
    parse_message, ErrorObject, ErrorResponse, Id, Incoming, ParseError, Params, PartialInfo,
    Request, Response, CODE_INTERNAL_ERROR, CODE_INVALID_REQUEST, CODE_METHOD_NOT_FOUND,
    CODE_PARSE_ERROR,
};
