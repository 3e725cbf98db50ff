mod unet;

pub(crate) use unet::UNetConfig;
