use std::net::SocketAddrV4;

/// The two endpoint addresses a socket is bound to.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Quad {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
}

impl Quad {
    /// The binding a peer socket must carry to receive what this one sends.
    pub fn reverse(self) -> Quad {
        Quad {
            local: self.remote,
            remote: self.local,
        }
    }
}
