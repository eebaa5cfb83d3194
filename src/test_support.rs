#[cfg(test)]
pub mod test_support {
    use crate::core::identifier::{RemoteNode, SwarmId, ID_BYTES};
    use ethereum_types::H160;

    pub fn id_with_first_byte(b: u8) -> SwarmId {
        let mut id = [0u8; ID_BYTES];
        id[0] = b;
        SwarmId(H160::from(id))
    }

    pub fn remote_with_first_byte(b: u8, port: u16) -> RemoteNode {
        RemoteNode::new(id_with_first_byte(b), format!("127.0.0.1:{port}"))
    }
}
