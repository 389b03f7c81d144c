//! Physical device kinds, masks and descriptors.

use bitflags::bitflags;

/// Identifier of a hardware module (one audio HAL instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u32);

bitflags! {
    /// Bitmask over the closed set of physical device kinds.
    ///
    /// Output and input kinds share one flag space; a mask is an output mask
    /// when it only contains bits from [`DeviceMask::ALL_OUT`] and an input
    /// mask when it only contains bits from [`DeviceMask::ALL_IN`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceMask: u64 {
        /// Handset earpiece.
        const EARPIECE = 1 << 0;
        /// Built-in speaker.
        const SPEAKER = 1 << 1;
        /// Wired headset (with microphone).
        const WIRED_HEADSET = 1 << 2;
        /// Wired headphones (no microphone).
        const WIRED_HEADPHONE = 1 << 3;
        /// Bluetooth SCO, generic endpoint.
        const BLUETOOTH_SCO = 1 << 4;
        /// Bluetooth SCO headset.
        const BLUETOOTH_SCO_HEADSET = 1 << 5;
        /// Bluetooth SCO car kit.
        const BLUETOOTH_SCO_CARKIT = 1 << 6;
        /// Bluetooth A2DP, generic endpoint.
        const BLUETOOTH_A2DP = 1 << 7;
        /// Bluetooth A2DP headphones.
        const BLUETOOTH_A2DP_HEADPHONES = 1 << 8;
        /// Bluetooth A2DP speaker.
        const BLUETOOTH_A2DP_SPEAKER = 1 << 9;
        /// HDMI sink.
        const HDMI = 1 << 10;
        /// USB headset.
        const USB_HEADSET = 1 << 11;
        /// Hearing aid.
        const HEARING_AID = 1 << 12;
        /// Remote submix render endpoint (virtual).
        const REMOTE_SUBMIX = 1 << 13;
        /// Telephony downlink sink (towards the far end of a call).
        const TELEPHONY_TX = 1 << 14;
        /// Stub output (discards audio).
        const STUB = 1 << 15;

        /// Built-in microphone.
        const BUILTIN_MIC = 1 << 32;
        /// Secondary built-in microphone.
        const BACK_MIC = 1 << 33;
        /// Wired headset microphone.
        const WIRED_HEADSET_MIC = 1 << 34;
        /// Bluetooth SCO microphone.
        const BLUETOOTH_SCO_MIC = 1 << 35;
        /// USB headset microphone.
        const USB_MIC = 1 << 36;
        /// Remote submix capture endpoint (virtual).
        const REMOTE_SUBMIX_CAPTURE = 1 << 37;
        /// Telephony uplink source (audio from the far end of a call).
        const TELEPHONY_RX = 1 << 38;
        /// FM tuner source.
        const FM_TUNER = 1 << 39;

        /// All output kinds.
        const ALL_OUT = Self::EARPIECE.bits()
            | Self::SPEAKER.bits()
            | Self::WIRED_HEADSET.bits()
            | Self::WIRED_HEADPHONE.bits()
            | Self::BLUETOOTH_SCO.bits()
            | Self::BLUETOOTH_SCO_HEADSET.bits()
            | Self::BLUETOOTH_SCO_CARKIT.bits()
            | Self::BLUETOOTH_A2DP.bits()
            | Self::BLUETOOTH_A2DP_HEADPHONES.bits()
            | Self::BLUETOOTH_A2DP_SPEAKER.bits()
            | Self::HDMI.bits()
            | Self::USB_HEADSET.bits()
            | Self::HEARING_AID.bits()
            | Self::REMOTE_SUBMIX.bits()
            | Self::TELEPHONY_TX.bits()
            | Self::STUB.bits();
        /// All input kinds.
        const ALL_IN = Self::BUILTIN_MIC.bits()
            | Self::BACK_MIC.bits()
            | Self::WIRED_HEADSET_MIC.bits()
            | Self::BLUETOOTH_SCO_MIC.bits()
            | Self::USB_MIC.bits()
            | Self::REMOTE_SUBMIX_CAPTURE.bits()
            | Self::TELEPHONY_RX.bits()
            | Self::FM_TUNER.bits();
        /// All Bluetooth SCO output endpoints.
        const ALL_SCO_OUT = Self::BLUETOOTH_SCO.bits()
            | Self::BLUETOOTH_SCO_HEADSET.bits()
            | Self::BLUETOOTH_SCO_CARKIT.bits();
        /// All Bluetooth A2DP output endpoints.
        const ALL_A2DP_OUT = Self::BLUETOOTH_A2DP.bits()
            | Self::BLUETOOTH_A2DP_HEADPHONES.bits()
            | Self::BLUETOOTH_A2DP_SPEAKER.bits();
        /// Devices worn on or in the ear, used for sonification attenuation.
        const HEADSET_CLASS = Self::BLUETOOTH_A2DP.bits()
            | Self::BLUETOOTH_A2DP_HEADPHONES.bits()
            | Self::WIRED_HEADSET.bits()
            | Self::WIRED_HEADPHONE.bits()
            | Self::USB_HEADSET.bits()
            | Self::HEARING_AID.bits();
        /// Virtual capture endpoints, exempt from concurrency arbitration.
        const VIRTUAL_IN = Self::REMOTE_SUBMIX_CAPTURE.bits();
        /// Kinds that distinguish endpoints by address.
        const ADDRESS_QUALIFIED = Self::REMOTE_SUBMIX.bits()
            | Self::REMOTE_SUBMIX_CAPTURE.bits();
    }
}

impl DeviceMask {
    /// Whether this mask contains only output kinds (and at least one).
    pub fn is_output(self) -> bool {
        !self.is_empty() && Self::ALL_OUT.contains(self)
    }

    /// Whether this mask contains only input kinds (and at least one).
    pub fn is_input(self) -> bool {
        !self.is_empty() && Self::ALL_IN.contains(self)
    }

    /// Number of device kinds in the mask.
    pub fn count(self) -> u32 {
        self.bits().count_ones()
    }

    /// Whether the mask holds exactly one device kind.
    pub fn is_single(self) -> bool {
        self.count() == 1
    }

    /// Whether this kind distinguishes endpoints by address.
    pub fn distinguishes_on_address(self) -> bool {
        Self::ADDRESS_QUALIFIED.contains(self) && !self.is_empty()
    }

    /// Whether the mask refers only to virtual capture endpoints.
    pub fn is_virtual_input(self) -> bool {
        !self.is_empty() && Self::VIRTUAL_IN.contains(self)
    }

    /// The single kind used for volume bookkeeping when the mask spans
    /// several devices: the speaker wins if present, otherwise the
    /// lowest-numbered kind. An empty selection accounts as speaker.
    pub fn for_volume(self) -> DeviceMask {
        if self.is_empty() {
            return DeviceMask::SPEAKER;
        }
        if self.contains(DeviceMask::SPEAKER) {
            return DeviceMask::SPEAKER;
        }
        DeviceMask::from_bits_truncate(1 << self.bits().trailing_zeros())
    }
}

/// One physical device endpoint known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Device kind; exactly one bit set.
    pub kind: DeviceMask,
    /// Endpoint address; empty unless the kind distinguishes by address.
    pub address: String,
    /// Hardware module owning the endpoint.
    pub module: ModuleId,
}

impl DeviceDescriptor {
    /// Creates a descriptor for an address-less device kind.
    pub fn new(kind: DeviceMask, module: ModuleId) -> Self {
        Self {
            kind,
            address: String::new(),
            module,
        }
    }

    /// Creates a descriptor with an endpoint address.
    pub fn with_address(kind: DeviceMask, module: ModuleId, address: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
            module,
        }
    }
}

/// Set of currently available devices for one direction.
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    devices: Vec<DeviceDescriptor>,
}

impl DeviceList {
    /// Union of all device kinds in the list.
    pub fn types(&self) -> DeviceMask {
        self.devices
            .iter()
            .fold(DeviceMask::empty(), |acc, d| acc | d.kind)
    }

    /// Devices whose kind intersects `mask`.
    pub fn matching(&self, mask: DeviceMask) -> Vec<&DeviceDescriptor> {
        self.devices
            .iter()
            .filter(|d| mask.intersects(d.kind))
            .collect()
    }

    /// Device with the given kind and address, if present.
    pub fn find(&self, kind: DeviceMask, address: &str) -> Option<&DeviceDescriptor> {
        self.devices
            .iter()
            .find(|d| d.kind == kind && d.address == address)
    }

    /// Union of kinds owned by `module`.
    pub fn types_on_module(&self, module: ModuleId) -> DeviceMask {
        self.devices
            .iter()
            .filter(|d| d.module == module)
            .fold(DeviceMask::empty(), |acc, d| acc | d.kind)
    }

    /// Whether the exact descriptor is present.
    pub fn contains(&self, kind: DeviceMask, address: &str) -> bool {
        self.find(kind, address).is_some()
    }

    /// Adds a descriptor. Returns false if an identical one is present.
    pub fn add(&mut self, device: DeviceDescriptor) -> bool {
        if self.contains(device.kind, &device.address) {
            return false;
        }
        self.devices.push(device);
        true
    }

    /// Removes a descriptor. Returns false if it was not present.
    pub fn remove(&mut self, kind: DeviceMask, address: &str) -> bool {
        let before = self.devices.len();
        self.devices
            .retain(|d| !(d.kind == kind && d.address == address));
        self.devices.len() != before
    }

    /// All descriptors.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_checks() {
        assert!(DeviceMask::SPEAKER.is_output());
        assert!(!DeviceMask::SPEAKER.is_input());
        assert!(DeviceMask::BUILTIN_MIC.is_input());
        assert!(!(DeviceMask::SPEAKER | DeviceMask::BUILTIN_MIC).is_output());
        assert!(!DeviceMask::empty().is_output());
    }

    #[test]
    fn default_mask_is_empty() {
        assert_eq!(DeviceMask::default(), DeviceMask::empty());
    }

    #[test]
    fn volume_device_prefers_speaker() {
        let mask = DeviceMask::SPEAKER | DeviceMask::WIRED_HEADSET;
        assert_eq!(mask.for_volume(), DeviceMask::SPEAKER);
        assert_eq!(DeviceMask::empty().for_volume(), DeviceMask::SPEAKER);
        let mask = DeviceMask::WIRED_HEADSET | DeviceMask::HDMI;
        assert_eq!(mask.for_volume(), DeviceMask::WIRED_HEADSET);
    }

    #[test]
    fn device_list_add_remove() {
        let mut list = DeviceList::default();
        assert!(list.add(DeviceDescriptor::new(DeviceMask::SPEAKER, ModuleId(0))));
        assert!(!list.add(DeviceDescriptor::new(DeviceMask::SPEAKER, ModuleId(0))));
        assert_eq!(list.types(), DeviceMask::SPEAKER);
        assert!(list.remove(DeviceMask::SPEAKER, ""));
        assert!(!list.remove(DeviceMask::SPEAKER, ""));
        assert!(list.types().is_empty());
    }

    #[test]
    fn address_qualified_lookup() {
        let mut list = DeviceList::default();
        list.add(DeviceDescriptor::with_address(
            DeviceMask::REMOTE_SUBMIX,
            ModuleId(1),
            "0",
        ));
        assert!(list.find(DeviceMask::REMOTE_SUBMIX, "0").is_some());
        assert!(list.find(DeviceMask::REMOTE_SUBMIX, "1").is_none());
    }
}
