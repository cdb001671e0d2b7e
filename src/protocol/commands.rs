//! Command, result and status codes
//!
//! Codes are only meaningful together with the device type of the frame
//! they travel in.

/// Commands and results of the grid itself
pub mod grid {
    pub const CLEAR_ALL: u32 = 0x2001;
    pub const LOAD_GRID_CONFIG: u32 = 0x2101;
    pub const GET_GRID_CONFIG: u32 = 0x2102;
    pub const GET_CONFIG_LENGTH: u32 = 0x2103;
    pub const SETUP_GRID: u32 = 0x2201;

    pub mod result {
        pub const SUCCESS: u32 = 0x0001;
        pub const GET_CONFIG_DATA: u32 = 0x0002;
        pub const GET_CONFIG_LENGTH: u32 = 0x0003;
        pub const FAILURE: u32 = 0x0100;
        pub const UNKNOWN_COMMAND: u32 = 0x0101;
        pub const BUFFER_SIZE: u32 = 0x0102;
        pub const NOT_READY: u32 = 0x0103;
        pub const SETUP_ERROR: u32 = 0x0104;
        pub const GET_CONFIG_ERROR: u32 = 0x0105;
    }
}

/// Commands and results of the control server
pub mod server {
    pub const START_GRID: u32 = 0x0001;
    pub const STOP_GRID: u32 = 0x0002;

    pub mod result {
        pub const SUCCESS: u32 = 0x0001;
        /// Unsolicited status push
        pub const STATUS_DATA: u32 = 0x0010;
        pub const UNKNOWN_COMMAND: u32 = 0x0101;
    }

    /// Bits of the `status` field of a status push
    pub mod status {
        pub const GRID_LOADED: u16 = 0x0001;
        pub const GRID_STARTED: u16 = 0x0002;
    }
}

pub mod converter {
    /// OR'd with a [`mode`] value
    pub const SET_MODE: u32 = 0x0100;
    /// OR'd with a [`mode`] value, carries four data words
    pub const UPDATE_DATA: u32 = 0x0200;
    /// OR'd with [`super::PERIODIC_ON`] or [`super::PERIODIC_OFF`]
    pub const PERIODIC_DATA: u32 = 0x0300;

    pub mod mode {
        pub const OFF: u32 = 1;
        pub const IDLE: u32 = 2;
        pub const VOLTAGE_CONTROL_1: u32 = 3;
        pub const VOLTAGE_CONTROL_2: u32 = 4;
        pub const DROOP_CONTROL_1: u32 = 5;
        pub const DROOP_CONTROL_2: u32 = 6;
        pub const POWER_CONTROL: u32 = 7;
        pub const PRECHARGE_1: u32 = 8;
        pub const PRECHARGE_2: u32 = 9;
        pub const DISCHARGE_1: u32 = 10;
        pub const DISCHARGE_2: u32 = 11;
        pub const RESET: u32 = 255;
    }
}

pub mod fen_switchgear {
    /// OR'd with the switch bit mask
    pub const SET_SWITCH: u32 = 0x0100;
    /// OR'd with the switch bit mask
    pub const RESET_SWITCH: u32 = 0x0200;
    pub const GET_DATA: u32 = 0x0300;
    /// OR'd with [`super::PERIODIC_ON`] or [`super::PERIODIC_OFF`]
    pub const PERIODIC_DATA: u32 = 0x0400;
}

pub mod scibreak_breaker {
    pub const OPEN: u32 = 0x0201;
    pub const CLOSE: u32 = 0x0202;
    pub const PERIODIC_DATA_ON: u32 = 0x0401;
    pub const PERIODIC_DATA_OFF: u32 = 0x0402;
    pub const TURN_ON: u32 = 0x0601;
    pub const TURN_OFF: u32 = 0x0602;
}

/// Result shared by device commands
pub const DEVICE_SUCCESS: u32 = 0x0001;

pub const PERIODIC_ON: u32 = 1;
pub const PERIODIC_OFF: u32 = 2;

/// Error codes carried in ERROR frames
pub mod error {
    pub const UNSUPPORTED: u32 = 0x01;
}

/// Results with this bit set report a failure
pub const FAULT_BIT: u32 = 0x0100;

pub fn is_fault(result: u32) -> bool {
    result & FAULT_BIT != 0
}
