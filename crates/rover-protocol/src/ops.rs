//! 总线操作码常量定义
//!
//! 操作码空间按是否带响应划分为两段：
//!
//! - `1..=127`：fire-and-forget 命令，协处理器不回传数据载荷
//! - `129..=255`：请求命令，协处理器必须回传声明长度的数据载荷
//!
//! 协处理器固件依赖这个划分来决定是否准备响应缓冲区，
//! 因此新增操作码时必须落在正确的区间内。

/// fire-and-forget 命令区间上界（含）
pub const MAX_COMMAND_OP: u8 = 127;
/// 请求命令区间下界（含）
pub const MIN_REQUEST_OP: u8 = 129;

// === fire-and-forget 命令 (1-127) ===

pub const KEEP_ALIVE: u8 = 1;
pub const CONFIGURE_MOTOR: u8 = 2;
pub const SET_MOTOR: u8 = 3;
pub const CONFIGURE_ENCODER: u8 = 4;
pub const SET_MOTOR_MODE: u8 = 5;
pub const SET_FEEDBACK_DEVICE: u8 = 6;
pub const SET_PID_F: u8 = 7;
pub const SET_PID_P: u8 = 8;
pub const SET_PID_I: u8 = 9;
pub const SET_PID_D: u8 = 10;
pub const SET_PID_IZONE: u8 = 11;
pub const ENABLE: u8 = 12;
pub const DISABLE: u8 = 13;
pub const SET_MOTOR_INVERTED: u8 = 14;
pub const SET_ENCODER_INVERTED: u8 = 15;
pub const INIT_NAVIGATOR: u8 = 16;
pub const RESET_NAVIGATOR: u8 = 17;
pub const INVERT_NAVIGATOR: u8 = 18;
pub const DIGITAL_WRITE: u8 = 19;
pub const CREATE_COUNTER: u8 = 20;
pub const SET_MIN_MOTOR_POWER: u8 = 21;

// === 请求命令 (129-255) ===

pub const GET_PROCESSOR_TYPE: u8 = 129;
pub const GET_VALID_PINS: u8 = 130;
pub const GET_VALID_PWM_PINS: u8 = 131;
pub const GET_MAX_MOTORS: u8 = 132;
pub const GET_VALID_ANALOG_PINS: u8 = 133;
pub const GET_ENCODER_POS: u8 = 134;
pub const GET_ENCODER_SPEED: u8 = 135;
pub const DIGITAL_READ: u8 = 136;
pub const GET_NAVIGATOR_DATA: u8 = 137;
pub const GET_NAVIGATOR_STATE: u8 = 138;
pub const GET_NAVIGATOR_YAW: u8 = 139;
pub const GET_DIGITAL_COUNT: u8 = 140;

/// 判断操作码是否属于请求区间（协处理器会回传数据载荷）
pub fn expects_response(op: u8) -> bool {
    op >= MIN_REQUEST_OP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_partition() {
        let commands = [
            KEEP_ALIVE,
            CONFIGURE_MOTOR,
            SET_MOTOR,
            CONFIGURE_ENCODER,
            SET_MOTOR_MODE,
            SET_FEEDBACK_DEVICE,
            SET_PID_F,
            SET_PID_P,
            SET_PID_I,
            SET_PID_D,
            SET_PID_IZONE,
            ENABLE,
            DISABLE,
            SET_MOTOR_INVERTED,
            SET_ENCODER_INVERTED,
            INIT_NAVIGATOR,
            RESET_NAVIGATOR,
            INVERT_NAVIGATOR,
            DIGITAL_WRITE,
            CREATE_COUNTER,
            SET_MIN_MOTOR_POWER,
        ];
        for op in commands {
            assert!(op >= 1 && op <= MAX_COMMAND_OP, "opcode {} out of range", op);
            assert!(!expects_response(op));
        }

        let requests = [
            GET_PROCESSOR_TYPE,
            GET_VALID_PINS,
            GET_VALID_PWM_PINS,
            GET_MAX_MOTORS,
            GET_VALID_ANALOG_PINS,
            GET_ENCODER_POS,
            GET_ENCODER_SPEED,
            DIGITAL_READ,
            GET_NAVIGATOR_DATA,
            GET_NAVIGATOR_STATE,
            GET_NAVIGATOR_YAW,
            GET_DIGITAL_COUNT,
        ];
        for op in requests {
            assert!(op >= MIN_REQUEST_OP, "opcode {} out of range", op);
            assert!(expects_response(op));
        }
    }

    #[test]
    fn test_opcodes_unique() {
        let mut all = [
            KEEP_ALIVE,
            CONFIGURE_MOTOR,
            SET_MOTOR,
            CONFIGURE_ENCODER,
            SET_MOTOR_MODE,
            SET_FEEDBACK_DEVICE,
            SET_PID_F,
            SET_PID_P,
            SET_PID_I,
            SET_PID_D,
            SET_PID_IZONE,
            ENABLE,
            DISABLE,
            SET_MOTOR_INVERTED,
            SET_ENCODER_INVERTED,
            INIT_NAVIGATOR,
            RESET_NAVIGATOR,
            INVERT_NAVIGATOR,
            DIGITAL_WRITE,
            CREATE_COUNTER,
            SET_MIN_MOTOR_POWER,
            GET_PROCESSOR_TYPE,
            GET_VALID_PINS,
            GET_VALID_PWM_PINS,
            GET_MAX_MOTORS,
            GET_VALID_ANALOG_PINS,
            GET_ENCODER_POS,
            GET_ENCODER_SPEED,
            DIGITAL_READ,
            GET_NAVIGATOR_DATA,
            GET_NAVIGATOR_STATE,
            GET_NAVIGATOR_YAW,
            GET_DIGITAL_COUNT,
        ];
        all.sort_unstable();
        for pair in all.windows(2) {
            assert_ne!(pair[0], pair[1], "duplicate opcode {}", pair[0]);
        }
    }
}
