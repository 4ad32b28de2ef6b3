//! Init/shutdown bracket semantics.
//!
//! These run in their own binary: the bracket is process-wide state and
//! flipping it would race socket tests in a shared binary. Integration test
//! binaries are separate processes, so the cycle is safe to exercise here.

use lattice_net::{NetError, Networking, TcpSocket};

#[test]
fn init_shutdown_cycle() {
    assert!(!Networking::is_initialised());

    // Socket creation before init is a contract violation.
    let err = TcpSocket::new().unwrap_err();
    assert!(matches!(err, NetError::NotInitialised), "got {:?}", err);

    Networking::init().unwrap();
    assert!(Networking::is_initialised());

    // Double init is a contract violation.
    let err = Networking::init().unwrap_err();
    assert!(matches!(err, NetError::AlreadyInitialised), "got {:?}", err);

    // Sockets work inside the bracket.
    TcpSocket::new().unwrap();

    Networking::shutdown();
    assert!(!Networking::is_initialised());

    // And the bracket can be reopened.
    Networking::init().unwrap();
    TcpSocket::new().unwrap();
    Networking::shutdown();
}
