//! 操作台手柄状态
//!
//! 操作台把手柄轴值放大 1000 倍为整数传输，这里还原成 [-1, 1]
//! 的浮点值。状态整体以不可变快照存储，控制代码随时读取的是
//! 最近一次完整上报，不会看到半更新的轴值。

use std::sync::Arc;

/// 手柄快照
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JoystickState {
    /// 是否为双摇杆游戏手柄（否则为单摇杆飞行摇杆）
    pub gamepad: bool,
    /// 左摇杆横轴，[-1, 1]
    pub x: f64,
    /// 左摇杆纵轴，[-1, 1]
    pub y: f64,
    /// 右摇杆横轴（仅游戏手柄）
    pub rx: f64,
    /// 右摇杆纵轴（仅游戏手柄）
    pub ry: f64,
    /// 油门轴，[-1, 1]
    pub throttle: f64,
    /// 方向帽角度（度），无输入时为 -1
    pub pov: i32,
    /// 按键位图
    pub buttons: u32,
}

impl JoystickState {
    /// 按键是否按下，编号从 1 开始
    pub fn button(&self, n: u8) -> bool {
        n >= 1 && self.buttons >> (n - 1) & 1 != 0
    }

    /// 解析上报：手柄类型标志后跟 7 个整数
    /// （x y rx ry throttle pov buttons，轴值 ×1000）
    pub(crate) fn parse(args: &str) -> Option<Arc<Self>> {
        let mut chars = args.chars();
        let gamepad = chars.next()? == '1';

        let mut parts = chars.as_str().split_whitespace();
        let mut next = || parts.next()?.parse::<i32>().ok();
        let values: [i32; 7] = [
            next()?,
            next()?,
            next()?,
            next()?,
            next()?,
            next()?,
            next()?,
        ];

        let axis = |v: i32| f64::from(v) / 1000.0;
        Some(Arc::new(Self {
            gamepad,
            x: axis(values[0]),
            y: axis(values[1]),
            rx: axis(values[2]),
            ry: axis(values[3]),
            throttle: axis(values[4]),
            pov: values[5],
            buttons: values[6] as u32,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gamepad_report() {
        let state = JoystickState::parse("1 500 -250 0 1000 0 90 5").unwrap();
        assert!(state.gamepad);
        assert_eq!(state.x, 0.5);
        assert_eq!(state.y, -0.25);
        assert_eq!(state.ry, 1.0);
        assert_eq!(state.pov, 90);
        assert!(state.button(1));
        assert!(!state.button(2));
        assert!(state.button(3));
    }

    #[test]
    fn test_button_zero_is_never_pressed() {
        let state = JoystickState {
            buttons: u32::MAX,
            ..JoystickState::default()
        };
        assert!(!state.button(0));
        assert!(state.button(32));
    }

    #[test]
    fn test_malformed_reports_are_rejected() {
        assert!(JoystickState::parse("").is_none());
        assert!(JoystickState::parse("1 500 -250").is_none());
        assert!(JoystickState::parse("1 a b c d e f g").is_none());
    }
}
