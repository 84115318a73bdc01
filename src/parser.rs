/// Network registration state reported by `+CGREG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    NotRegistered,
    Home,
    Searching,
    Denied,
    Unknown,
    Roaming,
}

impl RegistrationStatus {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RegistrationStatus::NotRegistered),
            1 => Some(RegistrationStatus::Home),
            2 => Some(RegistrationStatus::Searching),
            3 => Some(RegistrationStatus::Denied),
            4 => Some(RegistrationStatus::Unknown),
            5 => Some(RegistrationStatus::Roaming),
            _ => None,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationStatus::Home | RegistrationStatus::Roaming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalQuality {
    pub rssi: u8,
    pub ber: u8,
}

impl SignalQuality {
    /// Approximate RSSI in dBm, `None` when the modem reports "unknown" (99).
    pub fn dbm(&self) -> Option<i32> {
        match self.rssi {
            0..=31 => Some(-113 + 2 * self.rssi as i32),
            _ => None,
        }
    }
}

/// Parse `+CGREG: <n>,<stat>` (query answer) or `+CGREG: <stat>` (URC)
pub fn parse_cgreg(line: &str) -> Option<RegistrationStatus> {
    let parts: Vec<&str> = line.strip_prefix("+CGREG:")?.split(',').collect();

    let stat = match parts.len() {
        1 => parts[0],
        _ => parts[1],
    };
    RegistrationStatus::from_code(stat.trim().parse().ok()?)
}

/// Parse `+CGATT: <state>`
pub fn parse_cgatt(line: &str) -> Option<bool> {
    match line.strip_prefix("+CGATT:")?.trim() {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}

/// Parse `+CSQ: <rssi>,<ber>`
pub fn parse_csq(line: &str) -> Option<SignalQuality> {
    let mut parts = line.strip_prefix("+CSQ:")?.split(',');

    let rssi = parts.next()?.trim().parse().ok()?;
    let ber = parts.next()?.trim().parse().ok()?;

    Some(SignalQuality { rssi, ber })
}

/// Parse `+CMQNEW: <mqtt_id>`
pub fn parse_cmqnew(line: &str) -> Option<u8> {
    line.strip_prefix("+CMQNEW:")?.trim().parse().ok()
}

/// Parse the unsolicited `+CMQDISCON: <mqtt_id>` broker drop notice
pub fn parse_cmqdiscon(line: &str) -> Option<u8> {
    line.strip_prefix("+CMQDISCON:")?.trim().parse().ok()
}

/// Parse `+CME ERROR: <code>`
pub fn parse_cme_error(line: &str) -> Option<u16> {
    line.strip_prefix("+CME ERROR:")?.trim().parse().ok()
}

/// Parse a raw pulse signal line from the sensor board
/// Format: "S512" or a bare "512"
pub fn parse_signal(line: &str) -> Option<u16> {
    let value = line.strip_prefix('S').unwrap_or(line);
    value.trim().parse().ok()
}
