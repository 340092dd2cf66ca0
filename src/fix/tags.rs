//! FIX 4.0 tag numbers used by this gateway.
//!
//! Only the tags this system actually reads or writes are named; FIX has
//! hundreds more that are irrelevant here.

pub const BEGIN_STRING: u32 = 8;
pub const BODY_LENGTH: u32 = 9;
pub const CHECK_SUM: u32 = 10;
pub const CUM_QTY: u32 = 14;
pub const EXEC_TRANS_TYPE: u32 = 20;
pub const AVG_PX: u32 = 6;
pub const MSG_SEQ_NUM: u32 = 34;
pub const MSG_TYPE: u32 = 35;
pub const ORDER_QTY: u32 = 38;
pub const ORD_STATUS: u32 = 39;
pub const ORD_TYPE: u32 = 40;
pub const ORIG_CL_ORD_ID: u32 = 41;
pub const PRICE: u32 = 44;
pub const SENDER_COMP_ID: u32 = 49;
pub const SENDING_TIME: u32 = 52;
pub const SIDE: u32 = 54;
pub const SYMBOL: u32 = 55;
pub const TARGET_COMP_ID: u32 = 56;
pub const TEXT: u32 = 58;
pub const TIME_IN_FORCE: u32 = 59;
pub const CL_ORD_ID: u32 = 11;
pub const ORDER_ID: u32 = 37;
pub const EXEC_ID: u32 = 17;
pub const LAST_SHARES: u32 = 32;
pub const LAST_PX: u32 = 31;
pub const ORD_REJ_REASON: u32 = 103;
pub const HEART_BT_INT: u32 = 108;
pub const TEST_REQ_ID: u32 = 112;
pub const ENCRYPT_METHOD: u32 = 98;
pub const RESET_SEQ_NUM_FLAG: u32 = 141;
pub const POSS_DUP_FLAG: u32 = 43;
pub const BEGIN_SEQ_NO: u32 = 7;
pub const END_SEQ_NO: u32 = 16;

pub const BEGIN_STRING_FIX40: &str = "FIX.4.0";

pub mod msg_type {
    pub const LOGON: &str = "A";
    pub const HEARTBEAT: &str = "0";
    pub const TEST_REQUEST: &str = "1";
    pub const LOGOUT: &str = "5";
    pub const RESEND_REQUEST: &str = "2";
    pub const NEW_ORDER_SINGLE: &str = "D";
    pub const ORDER_CANCEL_REQUEST: &str = "F";
    pub const EXECUTION_REPORT: &str = "8";
    pub const BALANCE_QUERY: &str = "U1";
    pub const BALANCE_RESPONSE: &str = "U2";
    pub const POSITION_QUERY: &str = "U3";
    pub const POSITION_RESPONSE: &str = "U4";
    pub const ACCOUNT_UPDATE: &str = "U5";
    pub const POSITION_UPDATE: &str = "U6";
    pub const INSTRUMENT_SEARCH: &str = "U7";
    pub const INSTRUMENT_SEARCH_RESPONSE: &str = "U8";
    pub const ORDER_HISTORY_QUERY: &str = "U9";
    pub const ORDER_HISTORY_RESPONSE: &str = "U10";
}

/// Standard header fields, in the order the codec emits them (after 8=/9=).
pub const STD_HEADER_ORDER: [u32; 5] = [
    MSG_TYPE,
    SENDER_COMP_ID,
    TARGET_COMP_ID,
    MSG_SEQ_NUM,
    SENDING_TIME,
];
