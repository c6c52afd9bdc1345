//! Command sequence issued once the radio acknowledges a new session.

use flexapi_core::ConnectionParams;

/// Status subscriptions requested on every connection.
pub const SUBSCRIPTIONS: &[&str] = &[
    "sub client all",
    "sub radio all",
    "sub tx all",
    "sub atu all",
    "sub amplifier all",
    "sub meter all",
    "sub pan all",
    "sub slice all",
    "sub gps all",
    "sub audio_stream all",
    "sub cwx all",
    "sub xvtr all",
    "sub memories all",
    "sub daxiq all",
    "sub dax all",
    "sub usb_cable all",
    "sub tnf all",
    "sub spot all",
    "sub license all",
    "sub apd all",
    "sub dvk all",
];

/// Informational queries whose replies populate the model.
const QUERIES: &[&str] = &[
    "info",
    "version",
    "ant list",
    "mic list",
    "radio uptime",
    "profile global info",
    "profile tx info",
    "profile mic info",
    "profile display info",
];

/// One setup command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupStep {
    Plain(String),
    /// `client gui [id]`; a successful reply carries the client id.
    ClientGui(String),
}

impl SetupStep {
    pub fn command(&self) -> &str {
        match self {
            SetupStep::Plain(c) | SetupStep::ClientGui(c) => c,
        }
    }
}

/// Build the setup sequence for a session.
///
/// `udp_port` is the local receive port, announced with `client udpport`
/// on LAN connections. WAN sessions register over UDP instead.
pub fn setup_commands(
    params: &ConnectionParams,
    udp_port: Option<u16>,
    is_wan: bool,
) -> Vec<SetupStep> {
    let mut steps = Vec::new();

    if params.is_gui() {
        let cmd = match &params.client_id {
            Some(id) => format!("client gui {id}"),
            None => "client gui".to_string(),
        };
        steps.push(SetupStep::ClientGui(cmd));
        steps.push(SetupStep::Plain(format!("client program {}", params.program)));
        steps.push(SetupStep::Plain(format!("client station {}", params.station)));
    } else {
        steps.push(SetupStep::Plain(format!("client program {}", params.program)));
        if let Some(id) = &params.bind_client_id {
            steps.push(SetupStep::Plain(format!("client bind client_id={id}")));
        }
    }

    if params.low_bandwidth_connect {
        steps.push(SetupStep::Plain("client low_bw_connect".into()));
    }
    if params.reduced_bandwidth_dax {
        steps.push(SetupStep::Plain("client set send_reduced_bw_dax=1".into()));
    }
    if !is_wan {
        if let Some(port) = udp_port {
            steps.push(SetupStep::Plain(format!("client udpport {port}")));
        }
    }

    steps.extend(QUERIES.iter().map(|q| SetupStep::Plain(q.to_string())));
    steps.extend(SUBSCRIPTIONS.iter().map(|s| SetupStep::Plain(s.to_string())));

    if params.request_cw_stream {
        steps.push(SetupStep::Plain("stream create netcw".into()));
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands(steps: &[SetupStep]) -> Vec<&str> {
        steps.iter().map(|s| s.command()).collect()
    }

    #[test]
    fn gui_local_sequence() {
        let params = ConnectionParams::gui("Logger", "Shack");
        let steps = setup_commands(&params, Some(4991), false);
        let cmds = commands(&steps);

        assert_eq!(steps[0], SetupStep::ClientGui("client gui".into()));
        assert_eq!(cmds[1], "client program Logger");
        assert_eq!(cmds[2], "client station Shack");
        assert!(cmds.contains(&"client udpport 4991"));
        assert!(cmds.contains(&"info"));
        assert!(cmds.contains(&"sub slice all"));
        assert!(!cmds.contains(&"stream create netcw"));
        // no duplicates
        let mut sorted = cmds.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), cmds.len());
    }

    #[test]
    fn persisted_client_id_and_options() {
        let params = ConnectionParams::gui("Logger", "Shack")
            .with_client_id("0E9D5A2C-0000")
            .with_low_bandwidth(true)
            .with_reduced_bandwidth_dax(true)
            .with_cw_stream(true);
        let steps = setup_commands(&params, Some(4991), true);
        let cmds = commands(&steps);

        assert_eq!(cmds[0], "client gui 0E9D5A2C-0000");
        assert!(cmds.contains(&"client low_bw_connect"));
        assert!(cmds.contains(&"client set send_reduced_bw_dax=1"));
        assert!(!cmds.iter().any(|c| c.starts_with("client udpport")));
        assert_eq!(*cmds.last().unwrap(), "stream create netcw");
    }

    #[test]
    fn non_gui_binds_to_gui_client() {
        let params = ConnectionParams::non_gui("Skimmer").with_bind_client_id("ABC");
        let steps = setup_commands(&params, Some(5000), false);
        let cmds = commands(&steps);

        assert!(!steps.iter().any(|s| matches!(s, SetupStep::ClientGui(_))));
        assert_eq!(cmds[0], "client program Skimmer");
        assert_eq!(cmds[1], "client bind client_id=ABC");
        assert!(!cmds.iter().any(|c| c.starts_with("client station")));
    }
}
