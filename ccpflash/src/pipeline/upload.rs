//! Block upload pipeline.

use log::info;

use crate::error::{Error, Result};
use crate::handler::MAX_BLOCK_UPLOAD_LEN;
use crate::pipeline::ProgressThrottle;
use crate::protocol::command::AddressExtension;
use crate::session::Session;
use crate::transport::Transport;

impl<T: Transport> Session<T> {
    /// Read `octets` bytes starting at `address` in `extension`.
    ///
    /// The region is read with block-transfer uploads of up to 255 bytes.
    /// `progress` receives `(bytes_done, total)` whenever at least 1% more of
    /// the region has arrived, and once at the end.
    pub fn upload_block(
        &mut self,
        extension: AddressExtension,
        address: u32,
        octets: usize,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Vec<u8>> {
        u32::try_from(octets)
            .ok()
            .and_then(|len| address.checked_add(len.saturating_sub(1)))
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "{octets} bytes at {address:#x} exceed the 32-bit address space"
                ))
            })?;

        info!("Uploading {octets} bytes from {extension} at {address:#010x}");
        self.set_mta(extension, address)?;

        let mut buffer = Vec::with_capacity(octets);
        let mut throttle = ProgressThrottle::new(octets);

        while buffer.len() < octets {
            let count = (octets - buffer.len()).min(MAX_BLOCK_UPLOAD_LEN);
            let data = self.upload(count, true)?;
            if data.len() != count {
                return Err(Error::UnexpectedMessage(format!(
                    "upload returned {} bytes, requested {count}",
                    data.len()
                )));
            }
            buffer.extend_from_slice(&data);

            if throttle.update(buffer.len()) {
                progress(buffer.len(), octets);
            }
        }

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerConfig;
    use crate::transport::{SimTransport, SimulatedTarget};

    fn session_with(data: &[u8]) -> Session<SimTransport> {
        let mut target = SimulatedTarget::new(0, 4096);
        target
            .load(AddressExtension::DATA_LOGGER, 0x100, data)
            .unwrap();
        let mut session = Session::new(SimTransport::new(target), HandlerConfig::default());
        session.connect(0).unwrap();
        session
    }

    #[test]
    fn test_upload_block_length_and_content() {
        let data: Vec<u8> = (0..700u32).map(|i| (i % 256) as u8).collect();
        let mut session = session_with(&data);

        let mut reports = Vec::new();
        let out = session
            .upload_block(AddressExtension::DATA_LOGGER, 0x100, 700, &mut |done, total| {
                reports.push((done, total));
            })
            .unwrap();

        assert_eq!(out.len(), 700);
        assert_eq!(out, data);
        assert_eq!(reports, vec![(255, 700), (510, 700), (700, 700)]);

        // three block uploads of 255/255/190
        let uploads: Vec<u8> = session
            .transport()
            .sent()
            .iter()
            .filter(|frame| frame.data[0] == 0x04)
            .map(|frame| frame.data[2])
            .collect();
        assert_eq!(uploads, vec![255, 255, 190]);
    }

    #[test]
    fn test_upload_block_zero_length() {
        let mut session = session_with(&[]);
        let out = session
            .upload_block(AddressExtension::DATA_LOGGER, 0, 0, &mut |_, _| {})
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_upload_block_out_of_range() {
        let mut session = session_with(&[]);
        let err = session
            .upload_block(AddressExtension::DATA_LOGGER, 4000, 200, &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[test]
    fn test_upload_block_range_check() {
        let mut session = session_with(&[]);
        let err = session
            .upload_block(AddressExtension::DATA_LOGGER, 0xFFFF_FFF0, 17, &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        // a region ending on the last address reaches the device
        let err = session
            .upload_block(AddressExtension::DATA_LOGGER, 0xFFFF_FFF0, 16, &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }
}
