#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    Zip,
    Tar,
    TarGz,
    TarXz,
    TarBz2,
    Dmg,
    Pkg,
    /// Anything else: copied into the staged directory verbatim.
    Raw,
}

impl ArchiveType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::TarXz => "tar.xz",
            Self::TarBz2 => "tar.bz2",
            Self::Dmg => "dmg",
            Self::Pkg => "pkg",
            Self::Raw => "raw",
        }
    }

    pub fn is_tarball(self) -> bool {
        matches!(self, Self::Tar | Self::TarGz | Self::TarXz | Self::TarBz2)
    }

    pub fn infer_from_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        let without_fragment = lower.split('#').next().unwrap_or(&lower);
        let without_query = without_fragment
            .split('?')
            .next()
            .unwrap_or(without_fragment);
        let file_name = without_query.rsplit('/').next().unwrap_or("");

        if file_name.ends_with(".zip") {
            return Self::Zip;
        }
        if file_name.ends_with(".tar.gz") || file_name.ends_with(".tgz") {
            return Self::TarGz;
        }
        if file_name.ends_with(".tar.xz") || file_name.ends_with(".txz") {
            return Self::TarXz;
        }
        if file_name.ends_with(".tar.bz2") || file_name.ends_with(".tbz") {
            return Self::TarBz2;
        }
        if file_name.ends_with(".tar") {
            return Self::Tar;
        }
        if file_name.ends_with(".dmg") {
            return Self::Dmg;
        }
        if file_name.ends_with(".pkg") {
            return Self::Pkg;
        }
        Self::Raw
    }
}
