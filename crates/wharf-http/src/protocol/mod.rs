mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::parse_byte_range;
pub use request::path_segments;
pub use request::RequestHead;

mod response;
pub use response::ResponseBody;
pub use response::ResponseHead;

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;

pub mod body;
