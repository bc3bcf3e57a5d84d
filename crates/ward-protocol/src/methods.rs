// Request types understood by the agent.

pub const START: &str = "start";
pub const STOP: &str = "stop";
pub const CONFIGURE: &str = "configure";
pub const TERMINATE: &str = "terminate";
