//! Elster Protocol Implementation
//!
//! The Elster parameter protocol addresses every value by a numeric index on a bus
//! participant. Requests and responses are plain CAN frames without any request id,
//! so matching a response to its request is left to the gateway's correlator.

pub mod codec;
pub mod table;
pub mod value;

pub use codec::{
    decode_frame, encode_query, encode_telegram, ElsterQuery, ElsterTelegram, TelegramType,
    Unrecognized, ELSTER_ADDRESS_MAX, ELSTER_INDEX_MAX,
};
pub use table::{find_by_name, lookup, parameter_name, parameters, ElsterParameter};
pub use value::{DecodedValue, ElsterValue, ElsterValueType, NOT_AVAILABLE};
