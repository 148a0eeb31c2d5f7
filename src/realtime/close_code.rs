use std::fmt;

/// Transport close codes as defined by RFC 6455 §7.4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
  Normal,
  GoingAway,
  Protocol,
  Unsupported,
  NoStatus,
  Abnormal,
  InvalidPayload,
  /// Also used by servers to reject a bad or expired token
  Policy,
  TooBig,
  MissingExtension,
  Internal,
  Restart,
  TryAgainLater,
  BadGateway,
  Tls,
  Other(u16),
}

/// Which backoff base a reconnect after this close uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
  Network,
  Server,
}

impl CloseCode {
  pub fn code(self) -> u16 {
    match self {
      CloseCode::Normal => 1000,
      CloseCode::GoingAway => 1001,
      CloseCode::Protocol => 1002,
      CloseCode::Unsupported => 1003,
      CloseCode::NoStatus => 1005,
      CloseCode::Abnormal => 1006,
      CloseCode::InvalidPayload => 1007,
      CloseCode::Policy => 1008,
      CloseCode::TooBig => 1009,
      CloseCode::MissingExtension => 1010,
      CloseCode::Internal => 1011,
      CloseCode::Restart => 1012,
      CloseCode::TryAgainLater => 1013,
      CloseCode::BadGateway => 1014,
      CloseCode::Tls => 1015,
      CloseCode::Other(code) => code,
    }
  }

  /// Normal closure, going away and policy violations are final.
  pub fn should_reconnect(self) -> bool {
    !matches!(
      self,
      CloseCode::Normal | CloseCode::GoingAway | CloseCode::Policy
    )
  }

  pub fn failure_kind(self) -> FailureKind {
    match self {
      CloseCode::Internal | CloseCode::Restart | CloseCode::TryAgainLater | CloseCode::BadGateway => {
        FailureKind::Server
      }
      _ => FailureKind::Network,
    }
  }

  pub fn describe(self) -> &'static str {
    match self {
      CloseCode::Normal => "normal closure",
      CloseCode::GoingAway => "going away",
      CloseCode::Protocol => "protocol error",
      CloseCode::Unsupported => "unsupported data",
      CloseCode::NoStatus => "no status received",
      CloseCode::Abnormal => "abnormal closure",
      CloseCode::InvalidPayload => "invalid payload",
      CloseCode::Policy => "policy violation",
      CloseCode::TooBig => "message too big",
      CloseCode::MissingExtension => "missing extension",
      CloseCode::Internal => "internal server error",
      CloseCode::Restart => "service restart",
      CloseCode::TryAgainLater => "try again later",
      CloseCode::BadGateway => "bad gateway",
      CloseCode::Tls => "TLS handshake failure",
      CloseCode::Other(_) => "unrecognized close code",
    }
  }
}

impl From<u16> for CloseCode {
  fn from(code: u16) -> Self {
    match code {
      1000 => CloseCode::Normal,
      1001 => CloseCode::GoingAway,
      1002 => CloseCode::Protocol,
      1003 => CloseCode::Unsupported,
      1005 => CloseCode::NoStatus,
      1006 => CloseCode::Abnormal,
      1007 => CloseCode::InvalidPayload,
      1008 => CloseCode::Policy,
      1009 => CloseCode::TooBig,
      1010 => CloseCode::MissingExtension,
      1011 => CloseCode::Internal,
      1012 => CloseCode::Restart,
      1013 => CloseCode::TryAgainLater,
      1014 => CloseCode::BadGateway,
      1015 => CloseCode::Tls,
      other => CloseCode::Other(other),
    }
  }
}

impl fmt::Display for CloseCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({})", self.code(), self.describe())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_final_codes_never_reconnect() {
    for code in [1000, 1001, 1008] {
      assert!(!CloseCode::from(code).should_reconnect(), "{}", code);
    }
    for code in [1002, 1005, 1006, 1011, 1015, 4000] {
      assert!(CloseCode::from(code).should_reconnect(), "{}", code);
    }
  }

  #[test]
  fn test_failure_kind() {
    assert_eq!(CloseCode::from(1006).failure_kind(), FailureKind::Network);
    assert_eq!(CloseCode::from(1011).failure_kind(), FailureKind::Server);
    assert_eq!(CloseCode::from(1014).failure_kind(), FailureKind::Server);
    assert_eq!(CloseCode::from(4001).failure_kind(), FailureKind::Network);
  }

  #[test]
  fn test_round_trip_and_display() {
    assert_eq!(CloseCode::from(1013).code(), 1013);
    assert_eq!(CloseCode::from(4321), CloseCode::Other(4321));
    assert_eq!(CloseCode::Abnormal.to_string(), "1006 (abnormal closure)");
  }
}
