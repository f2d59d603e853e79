use std::io;
use topowatch::error::{Result, TopowatchError};
use topowatch::supervisor::process::Role;

#[test]
fn test_error_types() {
    let err = TopowatchError::Spawn {
        role: Role::Agent,
        source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
    };
    assert!(err.to_string().contains("agent"));
    assert!(err.to_string().contains("no such file"));

    let err = TopowatchError::ReadinessTimeout {
        attempts: 10,
        last_error: "connection refused".to_string(),
    };
    assert!(err.to_string().contains("10"));
    assert!(err.to_string().contains("connection refused"));

    let err = TopowatchError::Privilege { euid: 1000 };
    assert!(err.to_string().contains("root"));
}

#[test]
fn test_io_error_conversion() {
    fn open() -> Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))?;
        Ok(())
    }
    assert!(matches!(open(), Err(TopowatchError::IoError(_))));
}

#[test]
fn test_version_const() {
    assert!(!topowatch::VERSION.is_empty());
}
