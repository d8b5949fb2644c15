pub const JOB_KEY_PREFIX: &str = "winch:job:";
pub const STATE_KEY_PREFIX: &str = "winch:state:";
pub const QUEUE_KEY_PREFIX: &str = "winch:queue:";
pub const PROCESSING_KEY_PREFIX: &str = "winch:processing:";
pub const SERVER_KEY_PREFIX: &str = "winch:server:";
pub const SERVER_SET_KEY: &str = "winch:servers";
pub const SCHEDULE_KEY: &str = "winch:schedule";

pub fn job_key(job_id: &str) -> String {
    format!("{JOB_KEY_PREFIX}{job_id}")
}

pub fn state_key(job_id: &str) -> String {
    format!("{STATE_KEY_PREFIX}{job_id}")
}

pub fn queue_key(queue: &str) -> String {
    format!("{QUEUE_KEY_PREFIX}{queue}")
}

/// The per-(server, queue) in-flight list.
pub fn processing_key(server: &str, queue: &str) -> String {
    format!("{PROCESSING_KEY_PREFIX}{server}:{queue}")
}

pub fn server_key(server: &str) -> String {
    format!("{SERVER_KEY_PREFIX}{server}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(job_key("j1"), "winch:job:j1");
        assert_eq!(state_key("j1"), "winch:state:j1");
        assert_eq!(queue_key("default"), "winch:queue:default");
        assert_eq!(processing_key("s1", "default"), "winch:processing:s1:default");
        assert_eq!(server_key("s1"), "winch:server:s1");
    }
}
