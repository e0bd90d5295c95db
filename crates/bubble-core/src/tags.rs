#[derive(Debug, Clone, Copy)]
pub struct Tag {
    pub key: &'static str,
    pub metric: &'static str,
    /// Column header in the pressure CSV, when the value is logged there.
    pub column: Option<&'static str>,
}

pub const PRESSURE_1: Tag = Tag {
    key: "pressure_1",
    metric: "bubble_pressure_1_bar",
    column: Some("Pressure1"),
};

pub const PRESSURE_2: Tag = Tag {
    key: "pressure_2",
    metric: "bubble_pressure_2_bar",
    column: Some("Pressure2"),
};

pub const PRESSURE_3: Tag = Tag {
    key: "pressure_3",
    metric: "bubble_pressure_3_bar",
    column: Some("Pressure3"),
};

pub const PRESSURE_EXTERNAL: Tag = Tag {
    key: "pressure_external",
    metric: "bubble_pressure_external_bar",
    column: Some("Pressure4"),
};

pub const VALVE_LINK_UP: Tag = Tag {
    key: "valve_link_up",
    metric: "bubble_valve_link_up",
    column: None,
};

pub const MOTOR_LINK_UP: Tag = Tag {
    key: "motor_link_up",
    metric: "bubble_motor_link_up",
    column: None,
};

pub const MOTOR_CALIBRATED: Tag = Tag {
    key: "motor_calibrated",
    metric: "bubble_motor_calibrated",
    column: None,
};

pub const MOTOR_POSITION_MM: Tag = Tag {
    key: "motor_position_mm",
    metric: "bubble_motor_position_mm",
    column: None,
};

pub const STEPS_REMAINING: Tag = Tag {
    key: "steps_remaining",
    metric: "bubble_sequence_steps_remaining",
    column: None,
};

pub const TIME_REMAINING_MS: Tag = Tag {
    key: "time_remaining_ms",
    metric: "bubble_sequence_time_remaining_ms",
    column: None,
};

pub const PRESSURE_TAGS: [Tag; 4] = [PRESSURE_1, PRESSURE_2, PRESSURE_3, PRESSURE_EXTERNAL];
